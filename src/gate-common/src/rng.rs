use rand::{rngs::OsRng, Rng, RngCore};

/// Size of a channel key in bytes (128-bit symmetric key).
pub const CHANNEL_KEY_LEN: usize = 16;

const DNS_TLDS: [&str; 4] = ["com", "net", "org", "io"];

/// Generate a fresh 128-bit symmetric key for a datagram channel.
pub fn random_key() -> [u8; CHANNEL_KEY_LEN] {
    let mut key = [0u8; CHANNEL_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Generate a random DNS-looking host name such as `kqzbtmwe.net`.
pub fn random_dns_name() -> String {
    let mut rng = OsRng;
    let label_len = rng.gen_range(6..=12);
    let label: String = (0..label_len)
        .map(|_| char::from(b'a' + rng.gen_range(0..26u8)))
        .collect();
    let tld = DNS_TLDS[rng.gen_range(0..DNS_TLDS.len())];
    format!("{label}.{tld}")
}
