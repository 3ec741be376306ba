use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use reqwest::{header, Client};
use scraper::{Html, Selector};
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing_subscriber::{fmt, EnvFilter};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "loader")]
#[command(about = "Fetch documents from S3, HTTP or disk into Documents JSONL")]
struct Cli {
    /// File with document references, one per line (s3://bucket/key, http(s) URL or local path)
    #[arg(long)]
    refs: String,
    /// Output JSONL file path, - for stdout
    #[arg(long, default_value = "-")]
    output: String,
    /// S3-compatible endpoint used for s3:// references (path-style requests)
    #[arg(long, env = "S3_ENDPOINT", default_value = "https://s3.amazonaws.com")]
    s3_endpoint: String,
    /// Number of references fetched concurrently
    #[arg(long, default_value_t = 8)]
    concurrency: usize,
    /// Request timeout seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
    #[arg(long, default_value = "nlp-loader/0.1")]
    user_agent: String,
}

/// Where a document lives.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reference {
    S3 { bucket: String, key: String },
    Http(Url),
    File(PathBuf),
}

fn parse_reference(raw: &str) -> Result<Reference> {
    if let Some(rest) = raw.strip_prefix("s3://") {
        let (bucket, key) = rest.split_once('/').ok_or_else(|| anyhow!("{raw}: missing object key"))?;
        if bucket.is_empty() || key.is_empty() {
            bail!("{raw}: bucket and key must be non-empty");
        }
        return Ok(Reference::S3 { bucket: bucket.to_string(), key: key.to_string() });
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Ok(Reference::Http(Url::parse(raw).with_context(|| format!("invalid URL {raw}"))?));
    }
    Ok(Reference::File(PathBuf::from(raw.strip_prefix("file://").unwrap_or(raw))))
}

fn s3_object_url(endpoint: &Url, bucket: &str, key: &str) -> Result<Url> {
    let mut url = endpoint.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow!("S3 endpoint {endpoint} cannot carry a path"))?
        .pop_if_empty()
        .push(bucket)
        .extend(key.split('/'));
    Ok(url)
}

/// Visible text of an HTML page's body, whitespace collapsed.
fn html_body_text(html: &str) -> Result<String> {
    let body = Selector::parse("body").map_err(|e| anyhow!("body selector: {e:?}"))?;
    let doc = Html::parse_document(html);
    let text = doc.select(&body).next().map(|n| n.text().collect::<Vec<_>>().join(" ")).unwrap_or_default();
    Ok(text.split_whitespace().collect::<Vec<_>>().join(" "))
}

#[derive(Serialize)]
struct OutDoc<'a> {
    key: &'a str,
    text: &'a str,
}

struct Fetcher {
    client: Client,
    s3_endpoint: Url,
}

impl Fetcher {
    async fn fetch(&self, reference: &Reference) -> Result<String> {
        match reference {
            Reference::File(path) => {
                let bytes = tokio::fs::read(path).await.with_context(|| format!("reading {}", path.display()))?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            Reference::S3 { bucket, key } => {
                let url = s3_object_url(&self.s3_endpoint, bucket, key)?;
                let (_, body) = self.get(url).await?;
                Ok(body)
            }
            Reference::Http(url) => {
                let (content_type, body) = self.get(url.clone()).await?;
                if content_type.is_some_and(|ct| ct.starts_with("text/html")) {
                    html_body_text(&body)
                } else {
                    Ok(body)
                }
            }
        }
    }

    async fn get(&self, url: Url) -> Result<(Option<String>, String)> {
        let resp = self.client.get(url.clone()).send().await?;
        if !resp.status().is_success() {
            bail!("GET {url} returned {}", resp.status());
        }
        let content_type = resp.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string);
        let bytes = resp.bytes().await?;
        Ok((content_type, String::from_utf8_lossy(&bytes).into_owned()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).with_writer(std::io::stderr).init();
    let args = Cli::parse();

    let client = Client::builder()
        .user_agent(args.user_agent.clone())
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(Duration::from_secs(args.timeout_secs))
        .build()?;
    let fetcher = Arc::new(Fetcher {
        client,
        s3_endpoint: Url::parse(&args.s3_endpoint).with_context(|| format!("invalid S3 endpoint {}", args.s3_endpoint))?,
    });

    let mut refs = Vec::new();
    let mut invalid = 0usize;
    for line in BufReader::new(File::open(&args.refs).with_context(|| format!("opening {}", args.refs))?).lines() {
        let raw = line?.trim().to_string();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        match parse_reference(&raw) {
            Ok(reference) => refs.push((raw, reference)),
            Err(e) => {
                tracing::error!(error = %e, "skipping invalid reference");
                invalid += 1;
            }
        }
    }
    if refs.is_empty() {
        bail!("no valid references in {}", args.refs);
    }
    tracing::info!(references = refs.len(), concurrency = args.concurrency, output = %args.output, "loading documents");

    let mut out: Box<dyn Write> = if args.output == "-" {
        Box::new(BufWriter::new(std::io::stdout().lock()))
    } else {
        Box::new(BufWriter::new(File::create(&args.output).with_context(|| format!("creating {}", args.output))?))
    };

    let concurrency = args.concurrency.max(1);
    let mut pending = refs.into_iter();
    let mut inflight = JoinSet::new();
    let (mut written, mut failed) = (0usize, 0usize);
    loop {
        while inflight.len() < concurrency {
            let Some((raw, reference)) = pending.next() else { break };
            let fetcher = Arc::clone(&fetcher);
            inflight.spawn(async move {
                let result = fetcher.fetch(&reference).await;
                (raw, result)
            });
        }
        let Some(joined) = inflight.join_next().await else { break };
        match joined {
            Ok((raw, Ok(text))) => {
                serde_json::to_writer(&mut out, &OutDoc { key: &raw, text: &text })?;
                out.write_all(b"\n")?;
                written += 1;
                tracing::debug!(reference = %raw, chars = text.len(), "document loaded");
            }
            Ok((raw, Err(e))) => {
                tracing::error!(reference = %raw, error = %e, "failed to load document");
                failed += 1;
            }
            Err(e) => {
                tracing::error!(error = %e, "fetch task aborted");
                failed += 1;
            }
        }
    }
    out.flush()?;

    tracing::info!(written, failed, invalid, "done");
    if written == 0 {
        bail!("no documents could be loaded");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_references_split_bucket_and_key() {
        assert_eq!(
            parse_reference("s3://corpus/2024/news/a.txt").unwrap(),
            Reference::S3 { bucket: "corpus".into(), key: "2024/news/a.txt".into() }
        );
        assert!(parse_reference("s3://corpus").is_err());
        assert!(parse_reference("s3:///key").is_err());
    }

    #[test]
    fn http_and_local_references() {
        assert!(matches!(parse_reference("https://example.com/a").unwrap(), Reference::Http(_)));
        assert_eq!(parse_reference("docs/a.txt").unwrap(), Reference::File(PathBuf::from("docs/a.txt")));
        assert_eq!(parse_reference("file:///tmp/a.txt").unwrap(), Reference::File(PathBuf::from("/tmp/a.txt")));
    }

    #[test]
    fn s3_urls_are_path_style() {
        let endpoint = Url::parse("http://localhost:9000/").unwrap();
        let url = s3_object_url(&endpoint, "corpus", "news/a b.txt").unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/corpus/news/a%20b.txt");
    }

    #[test]
    fn html_is_reduced_to_body_text() {
        let html = "<html><head><title>T</title></head><body><p>Ada  Lovelace</p>\n<p>wrote notes</p></body></html>";
        assert_eq!(html_body_text(html).unwrap(), "Ada Lovelace wrote notes");
    }
}
