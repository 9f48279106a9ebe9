//! Character-set policies for random tokens and passphrases.

use rand::{rngs::OsRng, seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

use super::{TokenError, MAX_SECRET_LENGTH, MIN_SECRET_LENGTH};

const LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &str = "0123456789";
const SYMBOLS: &str = "!#$%&()*+,-.:;<=>?@[]^_{}~";

/// Characters easily confused when read back by a human.
const AMBIGUOUS: &[char] = &['0', 'O', 'o', '1', 'l', 'I'];

/// Alphabet and length used to draw a random string.
///
/// Lowercase letters are always included; the other classes are opt-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharsetPolicy {
    pub length: usize,
    #[serde(default)]
    pub uppercase: bool,
    #[serde(default)]
    pub digits: bool,
    #[serde(default)]
    pub symbols: bool,
    /// Allow look-alike characters (`0 O o 1 l I`).
    #[serde(default)]
    pub ambiguous: bool,
}

impl CharsetPolicy {
    /// Policy for capability token identifiers: letters and digits, no look-alikes.
    #[must_use]
    pub const fn token(length: usize) -> Self {
        Self {
            length,
            uppercase: true,
            digits: true,
            symbols: false,
            ambiguous: false,
        }
    }

    /// Policy for backup passphrases: every class enabled.
    #[must_use]
    pub const fn password(length: usize) -> Self {
        Self {
            length,
            uppercase: true,
            digits: true,
            symbols: true,
            ambiguous: false,
        }
    }

    /// Every character class enabled by this policy, look-alikes removed.
    fn classes(&self) -> Vec<Vec<char>> {
        let mut classes = vec![LOWERCASE];
        if self.uppercase {
            classes.push(UPPERCASE);
        }
        if self.digits {
            classes.push(DIGITS);
        }
        if self.symbols {
            classes.push(SYMBOLS);
        }
        classes
            .into_iter()
            .map(|class| {
                class
                    .chars()
                    .filter(|c| self.ambiguous || !AMBIGUOUS.contains(c))
                    .collect()
            })
            .collect()
    }

    /// Check the length bounds.
    ///
    /// # Errors
    /// Returns [`TokenError::InvalidPolicy`] if the length is outside
    /// `MIN_SECRET_LENGTH..=MAX_SECRET_LENGTH`.
    pub fn check(&self) -> Result<(), TokenError> {
        if (MIN_SECRET_LENGTH..=MAX_SECRET_LENGTH).contains(&self.length) {
            Ok(())
        } else {
            Err(TokenError::InvalidPolicy(format!(
                "length must be between {MIN_SECRET_LENGTH} and {MAX_SECRET_LENGTH}"
            )))
        }
    }

    /// Draw a random string from the OS CSPRNG.
    ///
    /// Every enabled class contributes at least one character.
    ///
    /// # Errors
    /// Returns [`TokenError::InvalidPolicy`] if the policy fails [`Self::check`].
    pub fn generate(&self) -> Result<String, TokenError> {
        self.check()?;
        let classes = self.classes();
        let alphabet: Vec<char> = classes.iter().flatten().copied().collect();
        let mut rng = OsRng;

        let mut out: Vec<char> = classes
            .iter()
            .filter_map(|class| class.choose(&mut rng).copied())
            .collect();
        while out.len() < self.length {
            out.push(alphabet[rng.gen_range(0..alphabet.len())]);
        }
        out.shuffle(&mut rng);
        Ok(out.into_iter().collect())
    }
}
