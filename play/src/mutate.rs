//! A small set of named input-byte transforms `--input_mutator` selects
//! among, applied once to the whole input tape before a run starts.
//!
//! Named after the same strategies `granary/input/mutate.cc` offers
//! (`bitflipN`, `random`), reduced to their single-pass, whole-tape form —
//! the original's splicing/chunking/infinite pipelines are out of scope
//! here (see DESIGN.md's `grr-play` entry).

pub fn apply(name: &str, input: &mut [u8], seed: u64) {
    match name {
        "bitflip1" => bitflip(input, 0b0000_0001),
        "bitflip2" => bitflip(input, 0b0000_0011),
        "bitflip4" => bitflip(input, 0b0000_1111),
        "bitflip8" => bitflip(input, 0b1111_1111),
        "random" => random_bytes(input, seed),
        other => log::warn!("unknown --input_mutator {other:?}, leaving input untouched"),
    }
}

fn bitflip(input: &mut [u8], mask: u8) {
    for byte in input.iter_mut() {
        *byte ^= mask;
    }
}

/// A tiny xorshift64 PRNG so one mutator strategy doesn't need a `rand`
/// dependency of its own.
fn random_bytes(input: &mut [u8], seed: u64) {
    let mut state = seed | 1;
    for byte in input.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *byte = (state & 0xFF) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_name_leaves_input_untouched() {
        let mut data = vec![1, 2, 3];
        apply("nonexistent", &mut data, 1);
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn bitflip1_toggles_the_low_bit() {
        let mut data = vec![0b0000_0000, 0b0000_0001];
        apply("bitflip1", &mut data, 0);
        assert_eq!(data, vec![0b0000_0001, 0b0000_0000]);
    }

    #[test]
    fn random_is_deterministic_for_a_fixed_seed() {
        let mut a = vec![0u8; 8];
        let mut b = vec![0u8; 8];
        apply("random", &mut a, 42);
        apply("random", &mut b, 42);
        assert_eq!(a, b);
    }
}
