use std::{
    fs::{self, File},
    io::{self, Write},
    path::PathBuf,
};

use haul_http::{sniff_extension, Url, SNIFF_LEN};
use tracing::{event, Level};

use crate::FetchError;

/// Destination for one job's decoded body.
pub trait Sink {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// The body is complete.
    fn finish(&mut self) -> io::Result<()>;

    /// The job failed, discard anything written so far.
    fn fail(&mut self, reason: &FetchError);
}

/// What a sink is being opened for.
pub struct OutputRequest<'a> {
    /// Connection id, for diagnostics.
    pub id: u64,
    /// The URL the body is fetched from, after redirects.
    pub url: &'a Url,
    /// Explicit output name from the job.
    pub name: Option<&'a str>,
}

/// Opens sinks as replies start arriving.
pub trait SinkFactory {
    fn open(&mut self, request: &OutputRequest) -> io::Result<Box<dyn Sink>>;
}

/// Writes outputs as files in one directory.
pub struct FileSinks {
    dir: PathBuf,
}

impl FileSinks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SinkFactory for FileSinks {
    fn open(&mut self, request: &OutputRequest) -> io::Result<Box<dyn Sink>> {
        let (name, sniff) = match request.name {
            Some(name) => (name.to_string(), false),
            None => {
                let name = request.url.file_name().unwrap_or("index.html");
                (name.to_string(), !name.contains('.'))
            }
        };

        event!(Level::DEBUG, id = request.id, name = %name, sniff, "opening output");
        let sink = FileSink {
            path: self.dir.join(name),
            sniff,
            head: Vec::new(),
            file: None,
        };
        Ok(Box::new(sink))
    }
}

/// A file created on first write.
///
/// Without an extension in the name, the first bytes are held back until the file type can be
/// sniffed and the extension appended.
pub struct FileSink {
    path: PathBuf,
    sniff: bool,
    head: Vec<u8>,
    file: Option<File>,
}

impl FileSink {
    fn create(&mut self) -> io::Result<()> {
        if self.sniff {
            let mut path = self.path.clone().into_os_string();
            path.push(sniff_extension(&self.head));
            self.path = path.into();
            self.sniff = false;
        }

        let mut file = File::create(&self.path)?;
        file.write_all(&self.head)?;
        self.head = Vec::new();

        self.file = Some(file);
        Ok(())
    }
}

impl Sink for FileSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if let Some(file) = &mut self.file {
            return file.write_all(data);
        }

        if self.sniff && self.head.len() + data.len() < SNIFF_LEN {
            self.head.extend_from_slice(data);
            return Ok(());
        }

        self.head.extend_from_slice(data);
        self.create()
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.file.is_none() {
            self.create()?;
        }

        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        event!(Level::TRACE, path = ?self.path, "output finished");
        Ok(())
    }

    fn fail(&mut self, reason: &FetchError) {
        if self.file.take().is_none() {
            return;
        }

        event!(Level::DEBUG, path = ?self.path, %reason, "removing partial output");
        if let Err(error) = fs::remove_file(&self.path) {
            event!(Level::WARN, path = ?self.path, ?error, "failed to remove partial output");
        }
    }
}
