use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct BankConflictSimulator {
    pub num_banks: u32,
    pub bank_width: u32,
}

impl BankConflictSimulator {
    pub fn new(num_banks: u32, bank_width: u32) -> Self {
        Self { num_banks, bank_width }
    }

    fn bank_of(&self, byte_addr: u64) -> u64 {
        (byte_addr / self.bank_width as u64) % self.num_banks as u64
    }

    /// Worst-case serialization degree of one lockstep access. Lanes hitting the same
    /// word are served by broadcast and do not conflict.
    pub fn conflict_degree(&self, byte_addresses: &[u64]) -> u32 {
        let mut words_per_bank: HashMap<u64, Vec<u64>> = HashMap::new();
        for &addr in byte_addresses {
            let word = addr / self.bank_width as u64;
            let words = words_per_bank.entry(self.bank_of(addr)).or_default();
            if !words.contains(&word) {
                words.push(word);
            }
        }
        words_per_bank.values().map(|w| w.len() as u32).max().unwrap_or(0)
    }

    pub fn has_address_conflicts(&self, byte_addresses: &[u64]) -> bool {
        self.conflict_degree(byte_addresses) > 1
    }

    /// Padding, in elements appended to every row of `row_len` elements, that minimises
    /// the conflict degree of a lockstep read of `elements`. The smallest padding wins
    /// ties, so an access that is already conflict free gets 0.
    pub fn row_padding(&self, elements: &[u64], row_len: u64, element_bytes: u64, max_padding: u64) -> u64 {
        let row_len = row_len.max(1);
        (0..=max_padding)
            .min_by_key(|&pad| {
                let addresses: Vec<u64> = elements.iter()
                    .map(|&e| (e + e / row_len * pad) * element_bytes)
                    .collect();
                (self.conflict_degree(&addresses), pad)
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_walk_conflicts_until_padded() {
        let sim = BankConflictSimulator::new(32, 4);
        let column: Vec<u64> = (0..32).map(|lane| lane * 32).collect();
        let bytes: Vec<u64> = column.iter().map(|e| e * 4).collect();
        assert_eq!(sim.conflict_degree(&bytes), 32);
        assert_eq!(sim.row_padding(&column, 32, 4, 32), 1);
    }

    #[test]
    fn test_unit_stride_needs_no_padding() {
        let sim = BankConflictSimulator::new(32, 4);
        let row: Vec<u64> = (0..32).collect();
        assert_eq!(sim.row_padding(&row, 32, 4, 32), 0);
        // every fourth element of a 32-wide row
        let quarter: Vec<u64> = (0..32).map(|lane| lane * 4).collect();
        let padded: Vec<u64> = quarter.iter().map(|&e| (e + e / 32) * 4).collect();
        assert_eq!(sim.row_padding(&quarter, 32, 4, 32), 1);
        assert_eq!(sim.conflict_degree(&padded), 1);
    }

    #[test]
    fn test_broadcast_is_not_conflict() {
        let sim = BankConflictSimulator::new(32, 4);
        assert_eq!(sim.conflict_degree(&[64; 32]), 1);
        let stride2: Vec<u64> = (0..32).map(|lane| lane * 8).collect();
        assert_eq!(sim.conflict_degree(&stride2), 2);
    }
}
