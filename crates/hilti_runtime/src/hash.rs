//! Hashing used to route virtual threads onto workers.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over `bytes`.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Hash of a virtual thread id; only the low 32 bits participate.
pub fn hash_vid(vid: i64) -> u32 {
    let low = vid as u32;
    fnv1a(&low.to_le_bytes())
}

/// Index of the worker responsible for `vid` in a pool of `workers`.
///
/// The modulo introduces a small bias for pool sizes that are not powers of
/// two.
pub fn route(vid: i64, workers: usize) -> usize {
    debug_assert!(workers > 0);
    hash_vid(vid) as usize % workers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn only_low_bits_participate() {
        assert_eq!(hash_vid(7), hash_vid(7 + (1_i64 << 32)));
        assert_eq!(hash_vid(-1), fnv1a(&[0xff; 4]));
    }

    #[test]
    fn routing_is_stable_and_in_range() {
        for vid in [-1_000_i64, -1, 0, 1, 5, 42, i64::MAX, i64::MIN] {
            for workers in 1..9 {
                let first = route(vid, workers);
                assert!(first < workers);
                assert_eq!(first, route(vid, workers));
            }
        }
    }

    #[test]
    fn routing_spreads_consecutive_vids() {
        let workers = 4;
        let mut counts = [0_usize; 4];
        for vid in 0..4_000 {
            counts[route(vid, workers)] += 1;
        }
        for count in counts {
            assert!(count > 500, "unbalanced distribution: {counts:?}");
        }
    }
}
