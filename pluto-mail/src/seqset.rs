use serde::{Deserialize, Serialize};

use crate::MailError;

/// One endpoint of a sequence range: a number or `*` (the highest sequence
/// number in the mailbox).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Seq {
    Num(u32),
    Last,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqRange {
    pub from: Seq,
    pub to: Option<Seq>,
}

/// A parsed IMAP sequence set, e.g. `2,4:*`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqSet(pub Vec<SeqRange>);

impl SeqSet {
    /// Expand against a mailbox of `max` messages into sorted, unique
    /// sequence numbers. Numbers outside `1..=max` are rejected.
    pub fn resolve(&self, max: u32) -> Result<Vec<u32>, MailError> {
        if max == 0 {
            return Err(MailError::NoSuchMessage);
        }
        let fix = |s: Seq| match s {
            Seq::Num(n) => n,
            Seq::Last => max,
        };

        let mut seqs = Vec::new();
        for range in &self.0 {
            let a = fix(range.from);
            let b = range.to.map(fix).unwrap_or(a);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            if lo == 0 || hi > max {
                return Err(MailError::NoSuchMessage);
            }
            seqs.extend(lo..=hi);
        }
        seqs.sort_unstable();
        seqs.dedup();
        Ok(seqs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ranges: &[(Seq, Option<Seq>)]) -> SeqSet {
        SeqSet(
            ranges
                .iter()
                .map(|(from, to)| SeqRange { from: *from, to: *to })
                .collect(),
        )
    }

    #[test]
    fn resolves_mixed_set() {
        // 2,4:* against 5 messages -> 2,4,5
        let s = set(&[
            (Seq::Num(2), None),
            (Seq::Num(4), Some(Seq::Last)),
        ]);
        assert_eq!(s.resolve(5).unwrap(), vec![2, 4, 5]);
    }

    #[test]
    fn star_alone_is_the_last_message() {
        let s = set(&[(Seq::Last, None)]);
        assert_eq!(s.resolve(3).unwrap(), vec![3]);
    }

    #[test]
    fn full_range_in_reverse_order() {
        let s = set(&[(Seq::Last, Some(Seq::Num(1)))]);
        assert_eq!(s.resolve(4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn rejects_out_of_range_and_empty_mailboxes() {
        let s = set(&[(Seq::Num(6), None)]);
        assert!(s.resolve(5).is_err());
        let s = set(&[(Seq::Num(1), None)]);
        assert!(s.resolve(0).is_err());
    }
}
