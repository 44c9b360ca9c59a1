//! GTID executed-set algebra.
//!
//! A MySQL GTID set is `uuid:i-j[:k-l...][,uuid:...]`. The pipeline needs
//! three operations: parse, containment (the snapshot barrier waits until
//! the replica's executed set contains the reader's start position) and
//! merge (the reader folds each seen transaction into its progress set).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::DbError;

/// Closed interval of transaction numbers.
type Interval = (u64, u64);

/// A set of executed transactions, keyed by source server uuid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    sids: BTreeMap<String, Vec<Interval>>,
}

impl GtidSet {
    pub fn is_empty(&self) -> bool {
        self.sids.is_empty()
    }

    /// Total number of transactions in the set. Used to pick the earliest
    /// of several saved positions: replaying from an earlier set is safe
    /// because consumers dedupe by seqno.
    pub fn cardinality(&self) -> u64 {
        self.sids
            .values()
            .flat_map(|iv| iv.iter())
            .map(|(a, b)| b - a + 1)
            .sum()
    }

    /// Whether every transaction of `other` is contained in `self`.
    pub fn contains(&self, other: &GtidSet) -> bool {
        other.sids.iter().all(|(uuid, intervals)| {
            let Some(ours) = self.sids.get(uuid) else {
                return intervals.is_empty();
            };
            intervals.iter().all(|(a, b)| {
                ours.iter().any(|(x, y)| x <= a && b <= y)
            })
        })
    }

    /// Fold one executed transaction into the set.
    pub fn merge(&mut self, uuid: &str, gno: u64) {
        let uuid = uuid.to_ascii_lowercase();
        let intervals = self.sids.entry(uuid).or_default();
        for iv in intervals.iter_mut() {
            if gno >= iv.0 && gno <= iv.1 {
                return;
            }
            if gno + 1 == iv.0 {
                iv.0 = gno;
                return;
            }
            if gno == iv.1 + 1 {
                iv.1 = gno;
                // May now touch the next interval; normalize below.
                break;
            }
        }
        if !intervals.iter().any(|(a, b)| gno >= *a && gno <= *b) {
            intervals.push((gno, gno));
        }
        intervals.sort();
        normalize(intervals);
    }
}

fn normalize(intervals: &mut Vec<Interval>) {
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for &(a, b) in intervals.iter() {
        match merged.last_mut() {
            Some(last) if a <= last.1 + 1 => last.1 = last.1.max(b),
            _ => merged.push((a, b)),
        }
    }
    *intervals = merged;
}

impl FromStr for GtidSet {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = GtidSet::default();
        let text = s.trim();
        if text.is_empty() {
            return Ok(set);
        }
        // MySQL renders sets with commas and optional whitespace/newlines.
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut pieces = part.split(':');
            let uuid = pieces
                .next()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| DbError::BadGtid(s.to_string()))?
                .to_ascii_lowercase();
            let intervals = set.sids.entry(uuid).or_default();
            let mut any = false;
            for range in pieces {
                any = true;
                let (a, b) = match range.split_once('-') {
                    Some((a, b)) => (
                        a.parse().map_err(|_| DbError::BadGtid(s.to_string()))?,
                        b.parse().map_err(|_| DbError::BadGtid(s.to_string()))?,
                    ),
                    None => {
                        let v = range.parse().map_err(|_| DbError::BadGtid(s.to_string()))?;
                        (v, v)
                    }
                };
                if a > b {
                    return Err(DbError::BadGtid(s.to_string()));
                }
                intervals.push((a, b));
            }
            if !any {
                return Err(DbError::BadGtid(s.to_string()));
            }
            intervals.sort();
            normalize(intervals);
        }
        Ok(set)
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, intervals) in &self.sids {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{uuid}")?;
            for (a, b) in intervals {
                if a == b {
                    write!(f, ":{a}")?;
                } else {
                    write!(f, ":{a}-{b}")?;
                }
            }
        }
        Ok(())
    }
}

/// The earliest of several saved sets, by cardinality. `None` when every
/// input is empty or absent.
pub fn earliest<'a, I: IntoIterator<Item = &'a str>>(sets: I) -> Option<GtidSet> {
    let mut best: Option<GtidSet> = None;
    for text in sets {
        let Ok(set) = text.parse::<GtidSet>() else { continue };
        if set.is_empty() {
            continue;
        }
        let replace = match &best {
            Some(b) => set.cardinality() < b.cardinality(),
            None => true,
        };
        if replace {
            best = Some(set);
        }
    }
    best
}
