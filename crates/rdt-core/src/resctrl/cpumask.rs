//! CPU-mask bitmap (de)serialization for resctrl `cpus` files (spec.md
//! §6): hex, comma-separated 32-bit words. The kernel prints the
//! highest-numbered group of 32 cpus first, so word order in the file
//! is big-endian by word index even though each word's bits are the
//! usual little-endian bit order.

use std::collections::BTreeSet;

const WORD_BITS: u32 = 32;

/// Parse a `cpus` file's contents into the set of cpu ids it selects.
pub fn parse(contents: &str) -> BTreeSet<u32> {
    let words: Vec<u32> = contents
        .trim()
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| u32::from_str_radix(s, 16).ok())
        .collect();
    let num_words = words.len() as u32;
    let mut set = BTreeSet::new();
    for (i, word) in words.iter().enumerate() {
        // Words are printed most-significant-group first.
        let word_index = num_words - 1 - i as u32;
        for bit in 0..WORD_BITS {
            if word & (1 << bit) != 0 {
                set.insert(word_index * WORD_BITS + bit);
            }
        }
    }
    set
}

/// Format a cpu-id set the way the kernel's `cpus` file expects it.
pub fn format(cpus: &BTreeSet<u32>) -> String {
    if cpus.is_empty() {
        return "0".to_string();
    }
    let max_cpu = *cpus.iter().max().unwrap();
    let num_words = max_cpu / WORD_BITS + 1;
    let mut words = vec![0u32; num_words as usize];
    for &cpu in cpus {
        let word_index = cpu / WORD_BITS;
        let bit = cpu % WORD_BITS;
        words[word_index as usize] |= 1 << bit;
    }
    words
        .iter()
        .rev()
        .map(|w| format!("{w:08x}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_word() {
        let mut set = BTreeSet::new();
        set.insert(0);
        set.insert(3);
        let formatted = format(&set);
        assert_eq!(formatted, "00000009");
        assert_eq!(parse(&formatted), set);
    }

    #[test]
    fn round_trip_spans_multiple_words() {
        let mut set = BTreeSet::new();
        set.insert(0);
        set.insert(40);
        let formatted = format(&set);
        assert_eq!(parse(&formatted), set);
        assert!(formatted.contains(','));
    }

    #[test]
    fn empty_mask_is_all_zero_word() {
        let set = BTreeSet::new();
        assert_eq!(format(&set), "0");
        assert!(parse("0").is_empty());
    }
}
