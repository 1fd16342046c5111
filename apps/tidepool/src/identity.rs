use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

const ADJECTIVES: &[&str] = &[
    "amber", "ancient", "autumn", "billowing", "bitter", "bold", "brisk", "calm", "cold",
    "crimson", "curly", "damp", "dawn", "delicate", "divine", "dry", "dusky", "empty", "falling",
    "floral", "fragrant", "frosty", "gentle", "green", "hidden", "holy", "hushed", "icy", "jolly",
    "late", "lingering", "little", "lively", "lucky", "misty", "morning", "muddy", "mute",
    "nameless", "noisy", "odd", "patient", "plain", "polished", "proud", "purple", "quiet",
    "rapid", "raspy", "restless", "rough", "round", "royal", "shy", "silent", "snowy", "solitary",
    "sparkling", "spring", "still", "summer", "sweet", "twilight", "wandering",
];

const NOUNS: &[&str] = &[
    "atom", "bird", "boat", "breeze", "brook", "bush", "butterfly", "cherry", "cloud", "dew",
    "dream", "dust", "feather", "field", "fire", "firefly", "flower", "fog", "forest", "frog",
    "frost", "glade", "glitter", "grass", "hall", "haze", "heart", "hill", "kiwi", "lake", "leaf",
    "lion", "meadow", "moon", "mountain", "night", "paper", "penguin", "pine", "pond", "rain",
    "recipe", "resonance", "river", "sea", "shadow", "silence", "sky", "smoke", "snow", "sound",
    "star", "sun", "sunset", "surf", "thunder", "tiger", "tree", "violet", "water", "wave",
    "wildflower", "wind", "wood",
];

/// Stable identifier of one installation. Chosen once, persisted, never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// A fresh `adjective-noun-NNNN` identifier.
    pub fn generate() -> Self {
        Self(haiku(&mut rand::thread_rng()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

pub fn haiku<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    let suffix: u16 = rng.gen_range(0..10_000);
    format!("{adjective}-{noun}-{suffix:04}")
}
