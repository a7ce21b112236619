//! Bot name generation

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;

const LITERAL_NAMES: &[&str] = &[
    "Rusty", "Sparky", "Duchess", "Moth", "Biscuit", "Vex", "Pickles", "Marlowe", "Juniper",
    "Tank", "Nyx", "Clover",
];

const SYLLABLES: &[&str] = &[
    "ka", "ro", "mi", "zen", "tal", "vo", "ri", "bex", "lu", "dra", "shi", "mon", "ta", "quo",
    "fen", "ix",
];

/// Chance a bot gets a name from the literal pool
const LITERAL_CHANCE: f64 = 0.1;

/// Generates bot names that are unique within one match
#[derive(Debug, Default)]
pub struct NameGenerator {
    taken: HashSet<String>,
}

impl NameGenerator {
    /// Start with the names already used by humans in the match
    pub fn with_taken<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            taken: names
                .into_iter()
                .map(|n| n.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn next<R: Rng + ?Sized>(&mut self, rng: &mut R) -> String {
        for _ in 0..32 {
            let candidate = if rng.gen_bool(LITERAL_CHANCE) {
                LITERAL_NAMES
                    .choose(rng)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| syllable_name(rng))
            } else {
                syllable_name(rng)
            };
            if self.taken.insert(candidate.to_lowercase()) {
                return candidate;
            }
        }

        // Collisions all the way down: number the fallback
        let mut n = self.taken.len() + 1;
        loop {
            let candidate = format!("Bot{n}");
            if self.taken.insert(candidate.to_lowercase()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// 2-3 syllables, capitalised
fn syllable_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let count = rng.gen_range(2..=3);
    let raw: String = (0..count)
        .filter_map(|_| SYLLABLES.choose(rng).copied())
        .collect();

    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn names_are_unique_within_a_match() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut names = NameGenerator::with_taken(["Rusty"]);

        let generated: Vec<String> = (0..50).map(|_| names.next(&mut rng)).collect();
        let unique: HashSet<String> = generated.iter().map(|n| n.to_lowercase()).collect();

        assert_eq!(unique.len(), generated.len());
        assert!(!unique.contains("rusty"));
    }

    #[test]
    fn syllable_names_are_capitalised() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..20 {
            let name = syllable_name(&mut rng);
            assert!(name.len() >= 4);
            assert!(name.chars().next().unwrap().is_uppercase());
        }
    }
}
