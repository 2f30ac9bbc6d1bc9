use clap::{Parser, Subcommand};
use h2smuggle::detect::DetectContext;
use h2smuggle::dns_cache::DnsCache;
use h2smuggle::headers::Header;
use h2smuggle::log_writer::CsvLogWriter;
use h2smuggle::request::{send_request, RequestParams};
use h2smuggle::scheduler::{detect_multiple_targets, SchedulerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// Timeout applied to every request
    #[clap(long, global = true, default_value = "10s", value_parser = parse_duration)]
    timeout: Duration,

    /// Connect to this host:port instead of the target's own address
    #[clap(long, global = true, value_name = "HOST:PORT")]
    connect_to: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Make one request with custom headers
    Request {
        /// Target URL
        url: String,

        /// Headers as name:value; escape sequences like \r and \n are
        /// decoded, and ":authority:example.com" names a pseudo-header
        headers: Vec<String>,

        /// Request method
        #[clap(long, default_value = "GET")]
        method: String,

        /// Send this string as the body (escape sequences supported)
        #[clap(long, conflicts_with = "body_file")]
        body_str: Option<String>,

        /// Read the request body from this file
        #[clap(long, value_name = "PATH")]
        body_file: Option<PathBuf>,

        /// Send only the given headers, without any automatic ones
        #[clap(long)]
        no_auto_headers: bool,

        /// Do not add a user-agent header
        #[clap(long)]
        no_user_agent: bool,

        /// Append a content-length header matching the body
        #[clap(long)]
        auto_content_length: bool,

        /// Response body lines to print; -1 prints everything
        #[clap(long, default_value_t = 10)]
        body_lines: i64,
    },

    /// Detect whether targets are vulnerable
    Detect {
        /// Target URLs; bare hostnames become https://<host>/
        urls: Vec<String>,

        /// Log per-probe details
        #[clap(long)]
        verbose: bool,

        /// Comma-separated request methods to probe with
        #[clap(long, value_delimiter = ',', default_value = "GET,POST,OPTIONS")]
        method: Vec<String>,

        /// Number of worker threads
        #[clap(long, default_value_t = 100)]
        threads: usize,

        /// Read additional targets from this file, one per line
        #[clap(long, value_name = "PATH")]
        targets: Option<PathBuf>,

        /// Write one CSV record per probe to this file
        #[clap(long, value_name = "PATH")]
        csv_log: Option<PathBuf>,

        /// Also probe bare hostnames over HTTP/3
        #[clap(long)]
        try_http3: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    if let Commands::Detect { verbose: true, .. } = &cli.command {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    match cli.command {
        Commands::Request {
            url,
            headers,
            method,
            body_str,
            body_file,
            no_auto_headers,
            no_user_agent,
            auto_content_length,
            body_lines,
        } => {
            let target = Url::parse(&url)?;
            let mut params = RequestParams::new(
                target,
                String::from_utf8_lossy(&unquote_arg(&method)).into_owned(),
                cli.timeout,
            );
            params.connect_addr = cli.connect_to;
            params.no_auto_headers = no_auto_headers;
            params.no_user_agent = no_user_agent;
            params.add_content_length = auto_content_length;
            for arg in &headers {
                params.headers.push(parse_header_arg(arg)?);
            }
            let body = match body_file {
                Some(path) => std::fs::read(path)?,
                None => body_str.as_deref().map(unquote_arg).unwrap_or_default(),
            };
            if !body.is_empty() {
                params.body = vec![body];
            }

            do_and_print_request(&params, body_lines);
            Ok(())
        }

        Commands::Detect {
            urls,
            verbose: _,
            method,
            threads,
            targets,
            csv_log,
            try_http3,
        } => {
            let mut raw_targets = urls;
            if let Some(path) = targets {
                for line in std::fs::read_to_string(path)?.lines() {
                    let line = line.trim();
                    if !line.is_empty() {
                        raw_targets.push(line.to_string());
                    }
                }
            }
            let targets = expand_targets(raw_targets, try_http3);

            let csv = match csv_log {
                Some(path) => Some(CsvLogWriter::create(&path)?),
                None => None,
            };

            let ctx = DetectContext {
                dns: Arc::new(DnsCache::new()),
                connect_to: cli.connect_to,
                timeout: cli.timeout,
            };
            detect_multiple_targets(
                targets,
                ctx,
                SchedulerConfig {
                    threads,
                    request_methods: method,
                    csv,
                },
            )?;
            Ok(())
        }
    }
}

/// Bare hostnames become https:// targets; with `--try-http3` they are
/// probed over both transports.
fn expand_targets(raw: Vec<String>, try_http3: bool) -> Vec<String> {
    let mut targets = Vec::with_capacity(raw.len());
    for t in raw {
        if t.contains("://") {
            targets.push(t);
        } else {
            targets.push(format!("https://{}/", t));
            if try_http3 {
                targets.push(format!("https+h3://{}/", t));
            }
        }
    }
    targets
}

fn do_and_print_request(params: &RequestParams, body_lines: i64) {
    let dns = DnsCache::new();
    let response = match send_request(params, &dns) {
        Ok(response) => response,
        Err(e) => {
            println!("Error is {}", e);
            return;
        }
    };

    for h in &response.headers {
        println!(
            "{}: {}",
            String::from_utf8_lossy(&h.name),
            String::from_utf8_lossy(&h.value)
        );
    }
    println!();

    let body: Vec<u8> = response.body.concat();
    let body = String::from_utf8_lossy(&body);
    let mut printed = String::new();
    if body_lines < 0 {
        printed.push_str(&body);
    } else {
        for (i, line) in body.split_inclusive('\n').enumerate() {
            if i as i64 >= body_lines {
                break;
            }
            printed.push_str(line);
        }
    }
    print!("{}", printed);
    if !printed.ends_with('\n') {
        println!();
    }
}

/// `name:value`, after escape decoding. An empty name promotes the next
/// colon so `:authority:example.com` parses as a pseudo-header.
fn parse_header_arg(arg: &str) -> Result<Header, String> {
    let decoded = unquote_arg(arg);
    let at = decoded
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| format!("invalid header: {:?}", arg))?;
    let mut name = decoded[..at].to_vec();
    let mut value = decoded[at + 1..].to_vec();

    if name.is_empty() {
        if let Some(second) = value.iter().position(|&b| b == b':') {
            name = Vec::with_capacity(second + 1);
            name.push(b':');
            name.extend_from_slice(&value[..second]);
            value = value[second + 1..].to_vec();
        }
    }

    Ok(Header::new(name, value))
}

/// Decodes backslash escapes into real bytes; a malformed escape leaves
/// the argument untouched, like an unquotable string.
fn unquote_arg(s: &str) -> Vec<u8> {
    try_unquote(s).unwrap_or_else(|| s.as_bytes().to_vec())
}

fn try_unquote(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next()? {
            'r' => out.push(b'\r'),
            'n' => out.push(b'\n'),
            't' => out.push(b'\t'),
            'v' => out.push(0x0b),
            'f' => out.push(0x0c),
            '0' => out.push(0x00),
            '\\' => out.push(b'\\'),
            '"' => out.push(b'"'),
            '\'' => out.push(b'\''),
            'x' => {
                let hi = chars.next()?.to_digit(16)?;
                let lo = chars.next()?.to_digit(16)?;
                out.push((hi * 16 + lo) as u8);
            }
            'u' => {
                let mut code = 0u32;
                for _ in 0..4 {
                    code = code * 16 + chars.next()?.to_digit(16)?;
                }
                let c = char::from_u32(code)?;
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            _ => return None,
        }
    }
    Some(out)
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (number, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(at) => s.split_at(at),
        None => (s, "s"),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {:?}", s))?;
    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(format!("invalid duration unit: {:?}", unit)),
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("invalid duration: {:?}", s));
    }
    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_args_parse_and_promote_pseudo_headers() {
        let h = parse_header_arg("transfer-encoding : chunked").unwrap();
        assert_eq!(h.name, b"transfer-encoding ");
        assert_eq!(h.value, b" chunked");

        let h = parse_header_arg(":authority:example.com").unwrap();
        assert_eq!(h.name, b":authority");
        assert_eq!(h.value, b"example.com");

        assert!(parse_header_arg("no colon here").is_err());
    }

    #[test]
    fn unquote_decodes_escapes() {
        assert_eq!(unquote_arg(r"a\r\nb"), b"a\r\nb");
        assert_eq!(unquote_arg(r"\x00\xff"), vec![0x00, 0xff]);
        assert_eq!(unquote_arg(r"\u0085"), "\u{85}".as_bytes());
        // Malformed escapes leave the argument as-is.
        assert_eq!(unquote_arg(r"bad\q"), b"bad\\q");
        assert_eq!(unquote_arg(r"trailing\"), b"trailing\\");
    }

    #[test]
    fn duration_formats() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("ten").is_err());
    }

    #[test]
    fn target_expansion() {
        let out = expand_targets(
            vec!["example.com".to_string(), "https+h3://x/".to_string()],
            true,
        );
        assert_eq!(
            out,
            vec![
                "https://example.com/".to_string(),
                "https+h3://example.com/".to_string(),
                "https+h3://x/".to_string(),
            ]
        );

        let out = expand_targets(vec!["example.com".to_string()], false);
        assert_eq!(out, vec!["https://example.com/".to_string()]);
    }
}
