use crate::error::{Result, RmanError};
use crate::manifest::{FileEntry, Manifest};
use regex::{RegexSet, RegexSetBuilder};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct PatcherConfig {
    /// Worker count of the scan pool and of the fetch pool.
    pub concurrency: usize,
    pub retries: u32,
    pub retry_backoff: Duration,
    pub timeout: Duration,
    /// Overrides the product lookup in [`CdnTable`].
    pub bundle_base_url: Option<String>,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retries: 3,
            retry_backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            bundle_base_url: None,
        }
    }
}

/// Product marker -> bundle base URL, with a fallback for unmarked manifests.
#[derive(Clone, Debug)]
pub struct CdnTable {
    pub entries: Vec<(String, String)>,
    pub fallback: String,
}

impl Default for CdnTable {
    fn default() -> Self {
        Self {
            entries: vec![(
                "valorant".into(),
                "https://valorant.dyn.riotcdn.net/channels/public/bundles".into(),
            )],
            fallback: "https://lol.dyn.riotcdn.net/channels/public/bundles".into(),
        }
    }
}

impl CdnTable {
    pub fn base_for(&self, manifest_url: Option<&str>) -> &str {
        let url = manifest_url.unwrap_or_default().to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(marker, _)| url.contains(marker.as_str()))
            .map_or(self.fallback.as_str(), |(_, base)| base.as_str())
    }
}

/// Which files of a manifest take part in a run.
#[derive(Clone, Debug)]
pub struct Selection {
    /// Regular expressions searched (unanchored, case-insensitive) in full paths;
    /// empty selects every path.
    pub patterns: Vec<String>,
    /// Language names; empty disables language filtering.
    pub languages: Vec<String>,
    pub include_neutral: bool,
}

impl Default for Selection {
    fn default() -> Self {
        Self { patterns: Vec::new(), languages: Vec::new(), include_neutral: true }
    }
}

impl Selection {
    pub fn compile(&self, manifest: &Manifest) -> Result<Filter> {
        let names = if self.patterns.is_empty() {
            None
        } else {
            let set = RegexSetBuilder::new(&self.patterns)
                .case_insensitive(true)
                .build()
                .map_err(|e| RmanError::Selection(format!("name filter: {e}")))?;
            Some(set)
        };
        let languages = if self.languages.is_empty() {
            None
        } else {
            let (ids, unknown) = manifest.language_ids(&self.languages);
            for name in unknown {
                tracing::warn!(language = %name, "language not declared by manifest, ignored");
            }
            // Nothing resolved: same as no language filter.
            (!ids.is_empty()).then_some(ids)
        };
        Ok(Filter { names, languages, include_neutral: self.include_neutral })
    }
}

pub struct Filter {
    names: Option<RegexSet>,
    languages: Option<Vec<u8>>,
    include_neutral: bool,
}

impl Filter {
    pub fn matches(&self, file: &FileEntry) -> bool {
        if let Some(set) = &self.names {
            if !set.is_match(&file.name) {
                return false;
            }
        }
        match &self.languages {
            None => true,
            Some(_) if file.is_neutral() => self.include_neutral,
            Some(ids) => file.language_ids.iter().any(|l| ids.contains(l)),
        }
    }
}
