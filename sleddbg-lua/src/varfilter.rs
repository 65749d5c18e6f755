//! Variable name filters.
//!
//! A filter is a scope letter plus a pattern of literal segments
//! separated by `*`. Asterisks at the pattern edges unanchor the match
//! at that end; interior asterisks match any substring. A name is
//! filtered out when any filter registered for its scope matches.

use sleddbg_core::allocator::SequentialAllocator;
use sleddbg_core::{Result, StringSet, StringSetConfig};

use crate::scmp::LuaVariableScope;

#[derive(Debug, Clone, Copy)]
pub(crate) struct VarFilterConfig {
    pub max_filters: u16,
    pub max_patterns_per_filter: u16,
    pub max_pattern_len: u16,
}

/// One compiled name pattern.
#[derive(Debug)]
struct VarFilterName {
    scope: char,
    /// Pattern began with `*`.
    open_start: bool,
    /// Pattern ended with `*`.
    open_end: bool,
    /// Sum of segment lengths, for a cheap length prune.
    segment_len_total: usize,
    segments: StringSet,
}

impl VarFilterName {
    fn new(config: &VarFilterConfig) -> Self {
        Self {
            scope: ' ',
            open_start: false,
            open_end: false,
            segment_len_total: 0,
            segments: StringSet::new(&StringSetConfig {
                max_entries: config.max_patterns_per_filter,
                max_entry_len: config.max_pattern_len,
                allow_duplicates: true,
            }),
        }
    }

    fn setup(&mut self, scope: char, pattern: &str) -> bool {
        self.scope = scope;
        self.open_start = pattern.starts_with('*');
        self.open_end = pattern.ends_with('*');
        self.segment_len_total = 0;
        self.segments.clear();
        for segment in pattern.split('*').filter(|s| !s.is_empty()) {
            if !self.segments.add(segment) {
                return false;
            }
            self.segment_len_total += segment.len();
        }
        true
    }

    fn is_match(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        let count = self.segments.len();

        // Without asterisks a single segment is an exact comparison.
        if !self.open_start && !self.open_end && count == 1 {
            return self.segments.get(0) == Some(name);
        }
        if self.segment_len_total > name.len() {
            return false;
        }

        let mut position = 0;
        for (index, segment) in self.segments.iter().enumerate() {
            let Some(found) = name[position..].find(segment) else {
                return false;
            };
            let at = position + found;
            if index == 0 && !self.open_start && at != 0 {
                return false;
            }
            if index as u16 == count - 1 && !self.open_end && at + segment.len() != name.len() {
                return false;
            }
            position = at + segment.len();
        }
        true
    }
}

/// Fixed-capacity set of name filters across all scopes.
#[derive(Debug)]
pub(crate) struct VarFilterContainer {
    config: VarFilterConfig,
    filters: Vec<VarFilterName>,
    used: Vec<bool>,
}

impl VarFilterContainer {
    pub fn new(config: &VarFilterConfig) -> Self {
        let capacity = config.max_filters as usize;
        let mut filters = Vec::with_capacity(capacity);
        let mut used = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            filters.push(VarFilterName::new(config));
            used.push(false);
        }
        Self {
            config: *config,
            filters,
            used,
        }
    }

    pub fn required_memory(
        config: &VarFilterConfig,
        alloc: &mut dyn SequentialAllocator,
    ) -> Result<()> {
        let capacity = config.max_filters as usize;
        alloc.allocate(capacity * core::mem::size_of::<VarFilterName>(), 1)?;
        alloc.allocate(capacity, 1)?;
        for _ in 0..capacity {
            StringSet::required_memory(
                &StringSetConfig {
                    max_entries: config.max_patterns_per_filter,
                    max_entry_len: config.max_pattern_len,
                    allow_duplicates: true,
                },
                alloc,
            )?;
        }
        Ok(())
    }

    pub fn footprint(&self) -> usize {
        let per_filter_segments = self
            .filters
            .first()
            .map_or(0, |f| f.segments.footprint());
        self.filters.capacity() * core::mem::size_of::<VarFilterName>()
            + self.used.capacity()
            + self.filters.len() * per_filter_segments
    }

    pub fn max_filters(&self) -> u16 {
        self.config.max_filters
    }

    pub fn add_filter(&mut self, scope: char, pattern: &str) -> bool {
        if pattern.is_empty() {
            return false;
        }
        for slot in 0..self.filters.len() {
            if !self.used[slot] {
                if self.filters[slot].setup(scope, pattern) {
                    self.used[slot] = true;
                    return true;
                }
                return false;
            }
        }
        false
    }

    /// True when any filter registered for `scope` matches `name`.
    pub fn is_filtered(&self, name: &str, scope: char) -> bool {
        self.filters
            .iter()
            .zip(&self.used)
            .filter(|(filter, used)| **used && filter.scope == scope)
            .any(|(filter, _)| filter.is_match(name))
    }

    pub fn is_filtered_scope(&self, name: &str, scope: LuaVariableScope) -> bool {
        self.is_filtered(name, scope.letter())
    }

    /// Drop every filter registered for `scope`.
    pub fn clear(&mut self, scope: char) {
        for slot in 0..self.filters.len() {
            if self.used[slot] && self.filters[slot].scope == scope {
                self.used[slot] = false;
            }
        }
    }

    pub fn clear_all(&mut self) {
        self.used.fill(false);
    }
}

#[cfg(test)]
mod tests {
    use super::{VarFilterConfig, VarFilterContainer};

    fn container() -> VarFilterContainer {
        VarFilterContainer::new(&VarFilterConfig {
            max_filters: 8,
            max_patterns_per_filter: 4,
            max_pattern_len: 32,
        })
    }

    #[test]
    fn exact_pattern_matches_whole_name_only() {
        let mut filters = container();
        assert!(filters.add_filter('g', "score"));
        assert!(filters.is_filtered("score", 'g'));
        assert!(!filters.is_filtered("score2", 'g'));
        assert!(!filters.is_filtered("highscore", 'g'));
    }

    #[test]
    fn scope_is_respected() {
        let mut filters = container();
        assert!(filters.add_filter('l', "tmp"));
        assert!(filters.is_filtered("tmp", 'l'));
        assert!(!filters.is_filtered("tmp", 'g'));
    }

    #[test]
    fn leading_asterisk_unanchors_the_start() {
        let mut filters = container();
        assert!(filters.add_filter('g', "*_internal"));
        assert!(filters.is_filtered("foo_internal", 'g'));
        assert!(filters.is_filtered("_internal", 'g'));
        assert!(!filters.is_filtered("_internal_x", 'g'));
    }

    #[test]
    fn trailing_asterisk_unanchors_the_end() {
        let mut filters = container();
        assert!(filters.add_filter('g', "dbg_*"));
        assert!(filters.is_filtered("dbg_counter", 'g'));
        assert!(!filters.is_filtered("xdbg_counter", 'g'));
    }

    #[test]
    fn interior_asterisk_matches_any_substring() {
        let mut filters = container();
        assert!(filters.add_filter('u', "a*z"));
        assert!(filters.is_filtered("az", 'u'));
        assert!(filters.is_filtered("a_middle_z", 'u'));
        assert!(!filters.is_filtered("a_middle", 'u'));
        assert!(!filters.is_filtered("z_a", 'u'));
    }

    #[test]
    fn segments_must_appear_in_order() {
        let mut filters = container();
        assert!(filters.add_filter('g', "*one*two*"));
        assert!(filters.is_filtered("xx one yy two zz", 'g'));
        assert!(!filters.is_filtered("two then one", 'g'));
    }

    #[test]
    fn clear_only_drops_the_given_scope() {
        let mut filters = container();
        assert!(filters.add_filter('g', "a*"));
        assert!(filters.add_filter('l', "b*"));
        filters.clear('g');
        assert!(!filters.is_filtered("abc", 'g'));
        assert!(filters.is_filtered("bcd", 'l'));
        filters.clear_all();
        assert!(!filters.is_filtered("bcd", 'l'));
    }

    #[test]
    fn capacity_is_bounded() {
        let mut filters = VarFilterContainer::new(&VarFilterConfig {
            max_filters: 1,
            max_patterns_per_filter: 2,
            max_pattern_len: 16,
        });
        assert!(filters.add_filter('g', "a*"));
        assert!(!filters.add_filter('g', "b*"));
    }
}
