use std::ops::Bound;

use serde::{Deserialize, Serialize};

fn yes() -> bool {
    true
}

/// Options of a range scan or an iterator.
///
/// `start` and `end` are accepted as aliases of `gte` and `lte`; call
/// [`normalized`](RangeOptions::normalized) to rewrite them before use. When both an exclusive
/// and an inclusive bound are given for the same side, the exclusive one wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeOptions {
    /// keys strictly greater than this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<String>,
    /// keys greater than or equal to this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<String>,
    /// keys strictly less than this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<String>,
    /// keys less than or equal to this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<String>,
    /// alias of `gte`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// alias of `lte`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// the maximum number of records to return, `None` for no limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// return records in descending key order
    #[serde(default)]
    pub reverse: bool,
    /// include keys in iterator entries
    #[serde(default = "yes")]
    pub keys: bool,
    /// include values in iterator entries
    #[serde(default = "yes")]
    pub values: bool,
}

impl Default for RangeOptions {
    fn default() -> Self {
        RangeOptions {
            gt: None,
            gte: None,
            lt: None,
            lte: None,
            start: None,
            end: None,
            limit: None,
            reverse: false,
            keys: true,
            values: true,
        }
    }
}

impl RangeOptions {
    /// a scan over every key
    pub fn all() -> Self {
        Self::default()
    }

    /// builder method: keys in `from..=to`
    pub fn between(from: impl Into<String>, to: impl Into<String>) -> Self {
        RangeOptions {
            gte: Some(from.into()),
            lte: Some(to.into()),
            ..Self::default()
        }
    }

    /// rewrites the `start`/`end` aliases into `gte`/`lte`
    pub fn normalized(mut self) -> Self {
        if let Some(start) = self.start.take() {
            self.gte = Some(start);
        }
        if let Some(end) = self.end.take() {
            self.lte = Some(end);
        }
        self
    }

    /// the lower bound, after alias rewriting
    pub fn lower(&self) -> Bound<&str> {
        match (&self.gt, &self.gte, &self.start) {
            (Some(gt), _, _) => Bound::Excluded(gt.as_str()),
            (None, Some(gte), _) | (None, None, Some(gte)) => Bound::Included(gte.as_str()),
            (None, None, None) => Bound::Unbounded,
        }
    }

    /// the upper bound, after alias rewriting
    pub fn upper(&self) -> Bound<&str> {
        match (&self.lt, &self.lte, &self.end) {
            (Some(lt), _, _) => Bound::Excluded(lt.as_str()),
            (None, Some(lte), _) | (None, None, Some(lte)) => Bound::Included(lte.as_str()),
            (None, None, None) => Bound::Unbounded,
        }
    }

    /// `true` if `key` falls within the bounds
    pub fn contains(&self, key: &str) -> bool {
        let above = match self.lower() {
            Bound::Included(low) => key >= low,
            Bound::Excluded(low) => key > low,
            Bound::Unbounded => true,
        };
        let below = match self.upper() {
            Bound::Included(high) => key <= high,
            Bound::Excluded(high) => key < high,
            Bound::Unbounded => true,
        };
        above && below
    }

    /// `true` when no key can satisfy both bounds (e.g. `gte` greater than `lte`)
    pub fn is_empty(&self) -> bool {
        match (self.lower(), self.upper()) {
            (Bound::Unbounded, _) | (_, Bound::Unbounded) => false,
            (Bound::Included(low), Bound::Included(high)) => low > high,
            (Bound::Included(low), Bound::Excluded(high))
            | (Bound::Excluded(low), Bound::Included(high))
            | (Bound::Excluded(low), Bound::Excluded(high)) => low >= high,
        }
    }

    /// the effective limit
    pub fn take(&self) -> usize {
        self.limit.unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_become_inclusive_bounds() {
        let opts = RangeOptions {
            start: Some("b".to_owned()),
            end: Some("d".to_owned()),
            ..RangeOptions::default()
        }
        .normalized();
        assert_eq!(opts.gte.as_deref(), Some("b"));
        assert_eq!(opts.lte.as_deref(), Some("d"));
        assert!(opts.start.is_none() && opts.end.is_none());
        assert!(opts.contains("b") && opts.contains("d"));
        assert!(!opts.contains("a") && !opts.contains("e"));
    }

    #[test]
    fn exclusive_bounds_win() {
        let opts = RangeOptions {
            gt: Some("b".to_owned()),
            gte: Some("a".to_owned()),
            lt: Some("d".to_owned()),
            lte: Some("z".to_owned()),
            ..RangeOptions::default()
        };
        assert!(!opts.contains("b"));
        assert!(opts.contains("c"));
        assert!(!opts.contains("d"));
    }

    #[test]
    fn inverted_or_touching_exclusive_bounds_are_empty() {
        assert!(RangeOptions::between("z", "a").is_empty());
        assert!(!RangeOptions::between("a", "a").is_empty());
        let touching = RangeOptions {
            gt: Some("a".to_owned()),
            lt: Some("a".to_owned()),
            ..RangeOptions::default()
        };
        assert!(touching.is_empty());
        assert!(!RangeOptions::all().is_empty());
    }

    #[test]
    fn missing_flags_default_to_true() {
        let opts: RangeOptions = serde_json::from_str(r#"{"gte":"a"}"#).unwrap();
        assert!(opts.keys && opts.values);
        assert!(!opts.reverse);
        assert_eq!(opts.take(), usize::MAX);
    }
}
