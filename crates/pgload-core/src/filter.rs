//! Table selection for a run.
//!
//! A table participates iff it passes all three gates: the `only_tables`
//! allowlist (empty means all), the `including` patterns (any match, empty
//! means all), and the `excluding` patterns (no match). The same filter is
//! applied to index discovery so a deselected table never gets its indexes
//! rebuilt either.

use crate::LoadOptions;
use anyhow::Context;
use glob::Pattern;

#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    only: Vec<String>,
    including: Vec<Pattern>,
    excluding: Vec<Pattern>,
}

impl TableFilter {
    pub fn new(
        only: &[String],
        including: &[String],
        excluding: &[String],
    ) -> anyhow::Result<Self> {
        Ok(Self {
            only: only.to_vec(),
            including: compile(including)?,
            excluding: compile(excluding)?,
        })
    }

    pub fn from_options(opts: &LoadOptions) -> anyhow::Result<Self> {
        Self::new(&opts.only_tables, &opts.including, &opts.excluding)
    }

    pub fn selects(&self, table: &str) -> bool {
        (self.only.is_empty() || self.only.iter().any(|t| t == table))
            && (self.including.is_empty() || self.including.iter().any(|p| p.matches(table)))
            && !self.excluding.iter().any(|p| p.matches(table))
    }
}

fn compile(patterns: &[String]) -> anyhow::Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| Pattern::new(p).with_context(|| format!("bad table pattern {:?}", p)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLES: [&str; 4] = ["a", "b", "c", "d"];

    fn selected(filter: &TableFilter) -> Vec<&'static str> {
        TABLES.iter().copied().filter(|t| filter.selects(t)).collect()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_filter_selects_everything() {
        let f = TableFilter::new(&[], &[], &[]).unwrap();
        assert_eq!(selected(&f), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn only_tables_is_an_allowlist() {
        let f = TableFilter::new(&strings(&["b", "d"]), &[], &[]).unwrap();
        assert_eq!(selected(&f), vec!["b", "d"]);
    }

    #[test]
    fn including_patterns_intersect_with_only() {
        let f = TableFilter::new(&strings(&["a", "b", "c"]), &strings(&["[ab]"]), &[]).unwrap();
        assert_eq!(selected(&f), vec!["a", "b"]);
    }

    #[test]
    fn excluding_always_wins() {
        let f = TableFilter::new(&strings(&["a", "b"]), &strings(&["*"]), &strings(&["b"]))
            .unwrap();
        assert_eq!(selected(&f), vec!["a"]);
    }

    #[test]
    fn excluding_alone_subtracts() {
        let f = TableFilter::new(&[], &[], &strings(&["[cd]"])).unwrap();
        assert_eq!(selected(&f), vec!["a", "b"]);
    }

    #[test]
    fn bad_pattern_is_an_error() {
        assert!(TableFilter::new(&[], &strings(&["[unclosed"]), &[]).is_err());
    }
}
