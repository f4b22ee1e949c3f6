//! Driver Arguments
//!
//! Admin-style argument vectors: positional words, `-key=value` options and
//! bare `-flag` options.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Positional arguments plus options handed to a driver at load time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverArgs {
    pub args: Vec<String>,
    pub options: BTreeMap<String, String>,
}

impl DriverArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an argument vector. `--` ends option parsing.
    pub fn parse<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = DriverArgs::default();
        let mut options_done = false;

        for word in words {
            let word = word.as_ref();
            if options_done {
                parsed.args.push(word.to_string());
                continue;
            }
            if word == "--" {
                options_done = true;
                continue;
            }
            match word.strip_prefix('-') {
                Some(option) if !option.is_empty() => match option.split_once('=') {
                    Some((key, value)) => {
                        parsed.options.insert(key.to_string(), value.to_string());
                    }
                    None => {
                        parsed.options.insert(option.to_string(), String::new());
                    }
                },
                _ => parsed.args.push(word.to_string()),
            }
        }

        parsed
    }

    /// Parse a single whitespace separated line
    pub fn parse_line(line: &str) -> Self {
        Self::parse(line.split_whitespace())
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Overlay `self` on top of `base`: options in `self` win, positional
    /// arguments come from `self`.
    pub fn merged_over(&self, base: &DriverArgs) -> DriverArgs {
        let mut options = base.options.clone();
        options.extend(self.options.iter().map(|(k, v)| (k.clone(), v.clone())));
        DriverArgs {
            args: self.args.clone(),
            options,
        }
    }

    pub fn argc(&self) -> usize {
        self.args.len()
    }

    pub fn argv(&self, idx: usize) -> Option<&str> {
        self.args.get(idx).map(String::as_str)
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn has_option(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    /// Parse an option value, `None` when absent or empty
    pub fn option_parsed<T: std::str::FromStr>(&self, key: &str) -> Option<Result<T, T::Err>> {
        self.option(key)
            .filter(|v| !v.is_empty())
            .map(str::parse::<T>)
    }
}

impl std::fmt::Display for DriverArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut words: Vec<String> = self.args.clone();
        for (key, value) in &self.options {
            if value.is_empty() {
                words.push(format!("-{}", key));
            } else {
                words.push(format!("-{}={}", key, value));
            }
        }
        write!(f, "{}", words.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed() {
        let args = DriverArgs::parse_line("flush pool-a -count=5 -l -- -literal");
        assert_eq!(args.args, vec!["flush", "pool-a", "-literal"]);
        assert_eq!(args.option("count"), Some("5"));
        assert!(args.has_option("l"));
        assert_eq!(args.option("l"), Some(""));
    }

    #[test]
    fn test_option_parsed() {
        let args = DriverArgs::parse_line("-timer=30 -bad=x -empty=");
        assert_eq!(args.option_parsed::<u64>("timer"), Some(Ok(30)));
        assert!(matches!(args.option_parsed::<u64>("bad"), Some(Err(_))));
        assert!(args.option_parsed::<u64>("empty").is_none());
        assert!(args.option_parsed::<u64>("missing").is_none());
    }

    #[test]
    fn test_merged_over() {
        let global = DriverArgs::parse_line("-flush.count=5 -mode=auto");
        let per_load = DriverArgs::parse_line("extra -flush.count=9");
        let merged = per_load.merged_over(&global);

        assert_eq!(merged.option("flush.count"), Some("9"));
        assert_eq!(merged.option("mode"), Some("auto"));
        assert_eq!(merged.args, vec!["extra"]);
    }

    #[test]
    fn test_display() {
        let args = DriverArgs::parse_line("a -k=v -f");
        assert_eq!(args.to_string(), "a -f -k=v");
    }
}
