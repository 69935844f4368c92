use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use haul_http::{Url, UrlError};
use tracing::{event, Level};

use crate::{Extract, FetchError};

/// A two-stage page saved to disk until its target has been extracted.
pub(crate) struct ScratchFile {
    path: PathBuf,
    file: Option<File>,
}

impl ScratchFile {
    pub fn create(dir: &Path, id: u64) -> io::Result<Self> {
        let path = dir.join(format!("index-{:08x}.html", id));
        let file = File::create(&path)?;

        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.file {
            Some(file) => file.write_all(data),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Close the page and run `extract` over it line by line.
    ///
    /// Returns the capture group of the first matching line.
    pub fn find_match(&mut self, extract: &Extract) -> Result<String, FetchError> {
        if let Some(mut file) = self.file.take() {
            file.flush().map_err(FetchError::Scratch)?;
        }

        let file = File::open(&self.path).map_err(FetchError::Scratch)?;
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();

        loop {
            line.clear();
            let count = reader
                .read_until(b'\n', &mut line)
                .map_err(FetchError::Scratch)?;
            if count == 0 {
                return Err(FetchError::NoMatch);
            }

            // Pages aren't always valid UTF-8, the interesting part usually is
            let text = String::from_utf8_lossy(&line);
            let Some(captures) = extract.regex().captures(&text) else {
                continue;
            };

            return captures
                .get(extract.group())
                .map(|found| found.as_str().to_string())
                .ok_or(FetchError::MissingGroup(extract.group()));
        }
    }

    /// Delete the page, unless asked to keep it.
    pub fn dispose(mut self, keep: bool) {
        self.file = None;

        if keep {
            event!(Level::DEBUG, path = ?self.path, "keeping scratch page");
            return;
        }

        if let Err(error) = fs::remove_file(&self.path) {
            event!(Level::WARN, path = ?self.path, ?error, "failed to remove scratch page");
        }
    }
}

/// Absolute URL of a reference extracted from `page`.
///
/// Absolute and `//host/path` references resolve against the page. Anything else is appended to
/// `base_href` when the job has one, or resolved relative to the page otherwise.
pub(crate) fn resolve(page: &Url, base_href: Option<&str>, reference: &str) -> Result<Url, UrlError> {
    let reference = reference.trim();
    let rooted = reference.starts_with("//") || reference.contains("://");

    match base_href {
        Some(base_href) if !rooted => Url::parse(&format!("{}{}", base_href, reference)),
        _ => page.resolve(reference),
    }
}
