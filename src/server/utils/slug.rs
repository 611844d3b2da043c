use lazy_static::lazy_static;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "eager", "fancy", "gentle", "happy", "jolly", "kind", "lively",
    "lucky", "mighty", "nice", "polite", "proud", "quick", "quiet", "rapid", "shiny", "silly",
    "smart", "sunny", "swift", "tidy", "witty", "young", "bold", "cool", "fresh", "wise",
];

const NOUNS: &[&str] = &[
    "badger", "bear", "bird", "cat", "crab", "deer", "dog", "dolphin", "eagle", "fox", "frog",
    "goat", "hawk", "horse", "koala", "lion", "liger", "mole", "moose", "otter", "owl", "panda",
    "parrot", "puma", "rabbit", "seal", "shark", "sloth", "tiger", "wolf",
];

/// A human-readable random subdomain such as `quick-otter-42`.
pub fn human_readable_id() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quick");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("otter");
    let n: u16 = rng.gen_range(0..100);
    format!("{adjective}-{noun}-{n}")
}

lazy_static! {
    /// Requested subdomains: lowercase alphanumerics with inner hyphens.
    static ref SUBDOMAIN: Regex =
        Regex::new(r"^[a-z0-9][a-z0-9-]{4,63}[a-z0-9]$|^[a-z0-9]{4,63}$").expect("subdomain pattern");
}

/// Whether `id` is acceptable as a requested subdomain.
pub fn is_valid_subdomain(id: &str) -> bool {
    SUBDOMAIN.is_match(id)
}
