use regex::Regex;
use thiserror::Error;

/// Two-stage rule: the regex run over a fetched page, and the capture group holding the target.
#[derive(Debug, Clone)]
pub struct Extract {
    regex: Regex,
    group: usize,
}

impl Extract {
    /// Compile `pattern`. Group 0 is the whole match.
    pub fn new(pattern: &str, group: usize) -> Result<Self, JobError> {
        let regex = Regex::new(pattern)?;

        if group >= regex.captures_len() {
            return Err(JobError::NoSuchGroup {
                group,
                groups: regex.captures_len() - 1,
            });
        }

        Ok(Self { regex, group })
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    pub fn group(&self) -> usize {
        self.group
    }
}

/// One resource to fetch.
///
/// Read-only once handed to a session.
#[derive(Debug, Clone)]
pub struct Job {
    pub url: String,
    pub referer: Option<String>,
    /// Fetch `url` as a page and follow the reference this extracts from it.
    pub extract: Option<Extract>,
    /// Prefix for relative references extracted from the page.
    pub base_href: Option<String>,
    /// Output file name, instead of one derived from the final URL.
    pub output: Option<String>,
    /// Redirects are expected, follow them without warning.
    pub redirect_ok: bool,
    /// Accept any TLS certificate.
    pub insecure: bool,
}

impl Job {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            referer: None,
            extract: None,
            base_href: None,
            output: None,
            redirect_ok: false,
            insecure: false,
        }
    }

    pub fn with_extract(mut self, extract: Extract) -> Self {
        self.extract = Some(extract);
        self
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn with_base_href(mut self, base_href: impl Into<String>) -> Self {
        self.base_href = Some(base_href.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_redirect_ok(mut self, redirect_ok: bool) -> Self {
        self.redirect_ok = redirect_ok;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("bad regex")]
    Regex(#[from] regex::Error),
    #[error("regex has no group {group}, it has {groups}")]
    NoSuchGroup { group: usize, groups: usize },
}
