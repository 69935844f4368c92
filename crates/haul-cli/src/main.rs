mod cli;

use std::{fs, process::ExitCode, time::Duration};

use anyhow::{bail, Context as _, Error};
use clap::Parser;
use haul::{Extract, Job, Method, Proxy, SessionConfig};
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

use crate::cli::Args;

fn main() -> Result<ExitCode, Error> {
    let args = Args::parse();
    init_logging(args.verbose);
    event!(Level::DEBUG, ?args, "arguments parsed");

    let jobs = jobs(&args)?;
    if jobs.is_empty() {
        bail!("no URLs given");
    }

    let config = config(&args)?;
    let report = haul::run(config, jobs)?;
    println!("{}", report);

    if let Some(path) = &args.links_only {
        let mut links = report.links.join("\n");
        links.push('\n');
        fs::write(path, links).with_context(|| format!("failed to write {}", path.display()))?;
    }

    let code = if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    };
    Ok(code)
}

/// `RUST_LOG` wins over the verbosity flags.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn config(args: &Args) -> Result<SessionConfig, Error> {
    let proxy = match &args.proxy {
        Some(value) => Some(Proxy::parse(value).with_context(|| format!("bad proxy {:?}", value))?),
        None => None,
    };

    Ok(SessionConfig {
        concurrency: args.threads,
        read_timeout: Duration::from_secs(args.timeout),
        max_retries: args.retries,
        accept_gzip: !args.no_gzip,
        method: if args.head { Method::Head } else { Method::Get },
        proxy,
        randomize: args.randomize,
        links_only: args.links_only.is_some(),
        keep_scratch: args.keep,
        output_dir: args.dir.clone(),
        scratch_dir: args.scratch_dir.clone().unwrap_or_else(|| args.dir.clone()),
        ..Default::default()
    })
}

fn jobs(args: &Args) -> Result<Vec<Job>, Error> {
    let extract = match &args.regex {
        Some(pattern) => Some(Extract::new(pattern, args.group)?),
        None => None,
    };

    let mut entries: Vec<(String, Option<String>)> =
        args.urls.iter().map(|url| (url.clone(), None)).collect();

    if let Some(path) = &args.input {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        entries.extend(parse_input(&text));
    }

    let jobs = entries
        .into_iter()
        .map(|(url, output)| {
            let mut job = Job::new(url.clone())
                .with_redirect_ok(args.redirect_ok)
                .with_insecure(args.insecure);

            if let Some(extract) = &extract {
                job = job.with_extract(extract.clone());
            }
            if let Some(base_href) = &args.base_href {
                job = job.with_base_href(base_href.clone());
            }
            match args.referer.as_deref() {
                Some("url") => job = job.with_referer(url),
                Some(referer) => job = job.with_referer(referer),
                None => {}
            }
            if let Some(output) = output {
                job = job.with_output(output);
            }

            job
        })
        .collect();

    Ok(jobs)
}

/// One `url [output-name]` per line, blank lines and `#` comments skipped.
fn parse_input(text: &str) -> Vec<(String, Option<String>)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let url = fields.next()?.to_string();
            Some((url, fields.next().map(str::to_string)))
        })
        .collect()
}
