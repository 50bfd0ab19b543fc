//! Template file loading and search-path resolution (§6 supplement).
//!
//! spec.md lists the loader as an out-of-scope external collaborator but
//! specifies its interface: a search-path list (default `["prompts", "hol"]`),
//! UTF-8 read, comment filter, and caching by filename. Nothing beyond that
//! is implemented here — no hot reload, no directory watching, no recursive
//! include resolution.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;

use schnellru::LruMap;

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::parser::Parser;
use crate::span::Template;

/// Default search path, checked in order for each requested filename.
pub const DEFAULT_SEARCH_PATH: &[&str] = &["prompts", "hol"];

/// Resolves template filenames against a search path and caches parsed
/// templates by filename, the way `renderer::Statics::template_cache`
/// caches parsed Wikitext templates.
pub struct TemplateLoader {
    search_path: Vec<PathBuf>,
    config: Configuration,
    cache: LruMap<String, Rc<Template>>,
}

impl TemplateLoader {
    /// Builds a loader over `search_path`, checked in order for each
    /// requested filename.
    #[must_use]
    pub fn new<I, P>(search_path: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            search_path: search_path.into_iter().map(Into::into).collect(),
            config: Configuration::default(),
            cache: LruMap::new(128),
        }
    }

    /// Overrides the parser configuration used for templates loaded through
    /// this loader (default: [`Configuration::default`]).
    #[must_use]
    pub fn with_config(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }

    /// Loads and parses `name`, searching the configured search path in
    /// order and taking the first match. Subsequent calls with the same
    /// name return the cached template without touching the filesystem.
    pub fn load(&mut self, name: &str) -> Result<Rc<Template>> {
        if let Some(cached) = self.cache.get(name) {
            return Ok(cached.clone());
        }

        let path = self
            .resolve(name)
            .ok_or_else(|| Error::TemplateNotFound(name.to_string()))?;

        let bytes = fs::read(&path).map_err(|source| Error::Load {
            name: name.to_string(),
            source,
        })?;
        let text = String::from_utf8(bytes).map_err(|e| Error::Load {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;

        let mut parser = Parser::new(&self.config);
        let template = Rc::new(parser.parse(&text, name)?);
        self.cache.insert(name.to_string(), template.clone());
        Ok(template)
    }

    /// The first existing file named `name` under any directory on the
    /// search path, in order.
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.search_path
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }
}

impl Default for TemplateLoader {
    fn default() -> Self {
        Self::new(DEFAULT_SEARCH_PATH)
    }
}
