use rand::seq::IndexedRandom;

const SUBDOMAIN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUBDOMAIN_LENGTH: usize = 10;

// Generate a random subdomain candidate from an OS-seeded CSPRNG.
// Availability against the routing table is the caller's concern.
pub(crate) fn random_subdomain() -> String {
    let mut rng = rand::rng();
    (0..SUBDOMAIN_LENGTH)
        .map(|_| *SUBDOMAIN_ALPHABET.choose(&mut rng).unwrap() as char)
        .collect()
}
