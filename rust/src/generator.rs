//! Random password generation for new credentials.

use rand::rngs::OsRng;
use rand::seq::SliceRandom;

pub const DEFAULT_LENGTH: usize = 16;
pub const MAX_LENGTH: usize = 128;

/// Letters, digits, space and ASCII punctuation.
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz\
ABCDEFGHIJKLMNOPQRSTUVWXYZ\
0123456789 !\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// Draws `length` characters uniformly from the OS random source. Lengths
/// outside `1..=MAX_LENGTH` fall back to [`DEFAULT_LENGTH`].
pub fn generate_password(length: usize) -> String {
    let length = if (1..=MAX_LENGTH).contains(&length) {
        length
    } else {
        DEFAULT_LENGTH
    };
    let mut rng = OsRng;
    (0..length)
        .filter_map(|_| ALPHABET.choose(&mut rng).map(|&b| char::from(b)))
        .collect()
}
