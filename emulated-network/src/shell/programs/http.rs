//! `python -m http.server` and `curl`, speaking just enough HTTP/1.x to move files around

use crate::shell::io::Io;
use crate::shell::programs::{Invocation, ProgramFuture};
use crate::transport::TransportError;
use crate::transport::tcp::{TcpListener, TcpStream};
use clap::Parser;
use futures::FutureExt;
use std::fmt::Write as _;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

const DEFAULT_SERVER_PORT: u16 = 8000;
const MAX_REQUEST_SIZE: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;
const SERVER_VERSION: &str = "SimpleHTTP/0.6 Python/3.10.12";
const CURL_USER_AGENT: &str = "curl/7.81.0";

pub fn python(invocation: Invocation) -> ProgramFuture {
    async move {
        let module = match invocation.args.get(1..3) {
            Some([flag, module]) if flag == "-m" => Some(module.clone()),
            _ => None,
        };

        match module.as_deref() {
            Some("http.server") => http_server(invocation).await,
            Some(module) => {
                invocation.io.errln(&format!(
                    "/usr/bin/{}: No module named {module}",
                    invocation.program()
                ));
                1
            }
            None => match invocation.args.get(1) {
                Some(script) => {
                    invocation.io.errln(&format!(
                        "{}: can't open file '{}': [Errno 2] No such file or directory",
                        invocation.program(),
                        invocation.env.path(script).display()
                    ));
                    2
                }
                None => {
                    invocation
                        .io
                        .errln("python: the interactive interpreter is not available");
                    1
                }
            },
        }
    }
    .boxed()
}

#[derive(Parser, Debug)]
#[command(name = "http.server")]
struct ServerArgs {
    #[arg(default_value_t = DEFAULT_SERVER_PORT)]
    port: u16,
    /// Accepted for compatibility; the server listens on every address
    #[arg(short = 'b', long = "bind", value_name = "ADDRESS")]
    _bind: Option<String>,
    /// Serve this directory instead of the working directory
    #[arg(short = 'd', long = "directory")]
    directory: Option<String>,
}

async fn http_server(invocation: Invocation) -> i32 {
    let args: ServerArgs = match invocation.parse_args_from(&invocation.args[2..]) {
        Ok(args) => args,
        Err(status) => return status,
    };

    let io = &invocation.io;
    let listener = match TcpListener::bind(&invocation.node, args.port) {
        Ok(listener) => listener,
        Err(TransportError::AddressInUse) => {
            io.errln("OSError: [Errno 98] Address already in use");
            return 1;
        }
        Err(e) => {
            io.errln(&format!("OSError: {e}"));
            return 1;
        }
    };

    let root = match &args.directory {
        Some(directory) => invocation.env.path(directory),
        None => invocation.env.workdir.clone(),
    };

    io.outln(&format!(
        "Serving HTTP on 0.0.0.0 port {port} (http://0.0.0.0:{port}/) ...",
        port = args.port
    ));

    let network_start = invocation.node.ctx.start;
    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            Some(_) = handlers.join_next() => {}
            stream = listener.accept() => {
                handlers.spawn(serve(stream, root.clone(), io.clone(), network_start));
            }
        }
    }
}

async fn serve(stream: TcpStream, root: PathBuf, io: Io, network_start: Instant) {
    let Some(head) = read_request_head(&stream).await else {
        return;
    };

    let request_line = head.lines().next().unwrap_or_default().to_string();
    let response = respond(&root, &request_line);
    let elapsed = Instant::now().saturating_duration_since(network_start);
    if response.status < 400 {
        io.errln(&format!(
            "{} - - [{}] \"{request_line}\" {} -",
            stream.peer_addr().ip(),
            log_date(elapsed),
            response.status
        ));
    } else {
        io.errln(&format!(
            "{} - - [{}] code {}, message {}",
            stream.peer_addr().ip(),
            log_date(elapsed),
            response.status,
            response.message
        ));
        io.errln(&format!(
            "{} - - [{}] \"{request_line}\" {} -",
            stream.peer_addr().ip(),
            log_date(elapsed),
            response.status
        ));
    }

    let bytes = response.to_bytes(elapsed);
    if let Err(e) = stream.write_all(&bytes).await {
        tracing::debug!("http response to {} failed: {e}", stream.peer_addr());
        return;
    }

    stream.shutdown();
}

/// Reads until the blank line that ends the request headers
async fn read_request_head(stream: &TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut buf = vec![0; READ_CHUNK];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 || head.len() > MAX_REQUEST_SIZE {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }

    (!head.is_empty()).then(|| String::from_utf8_lossy(&head).into_owned())
}

struct Response {
    status: u16,
    message: &'static str,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
    send_body: bool,
}

impl Response {
    fn ok(content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            message: "OK",
            headers: vec![
                ("Content-type", content_type.to_string()),
                ("Content-Length", body.len().to_string()),
            ],
            body,
            send_body: true,
        }
    }

    fn error(status: u16, message: &'static str, explanation: &str) -> Self {
        let body = format!(
            "<!DOCTYPE HTML>\n\
             <html lang=\"en\">\n    \
             <head>\n        \
             <meta charset=\"utf-8\">\n        \
             <title>Error response</title>\n    \
             </head>\n    \
             <body>\n        \
             <h1>Error response</h1>\n        \
             <p>Error code: {status}</p>\n        \
             <p>Message: {message}.</p>\n        \
             <p>Error code explanation: {status} - {explanation}.</p>\n    \
             </body>\n\
             </html>\n"
        )
        .into_bytes();

        Self {
            status,
            message,
            headers: vec![
                ("Connection", "close".to_string()),
                ("Content-Type", "text/html;charset=utf-8".to_string()),
                ("Content-Length", body.len().to_string()),
            ],
            body,
            send_body: true,
        }
    }

    fn to_bytes(&self, elapsed: Duration) -> Vec<u8> {
        let mut head = format!("HTTP/1.0 {} {}\r\n", self.status, self.message);
        let _ = write!(head, "Server: {SERVER_VERSION}\r\n");
        let _ = write!(head, "Date: {}\r\n", http_date(elapsed));
        for (name, value) in &self.headers {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        if self.send_body {
            bytes.extend_from_slice(&self.body);
        }
        bytes
    }
}

fn respond(root: &Path, request_line: &str) -> Response {
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Response::error(400, "Bad request syntax", "Bad request syntax or unsupported method");
    };

    if method != "GET" && method != "HEAD" {
        return Response::error(
            501,
            "Unsupported method",
            "Server does not support this operation",
        );
    }

    let mut response = respond_get(root, target);
    response.send_body = method == "GET";
    response
}

fn respond_get(root: &Path, target: &str) -> Response {
    let url_path = target.split(['?', '#']).next().unwrap_or_default();
    let decoded = percent_decode(url_path);
    let path = translate_path(root, &decoded);

    if path.is_dir() {
        if !url_path.ends_with('/') {
            let mut response = Response::error(301, "Moved Permanently", "Object moved permanently");
            response.headers.insert(0, ("Location", format!("{url_path}/")));
            return response;
        }

        let index = path.join("index.html");
        if !index.is_file() {
            return match directory_listing(&path, &decoded) {
                Some(body) => Response::ok("text/html; charset=utf-8", body.into_bytes()),
                None => Response::error(404, "No permission to list directory", "Nothing matches the given URI"),
            };
        }
        return serve_file(&index);
    }

    serve_file(&path)
}

fn serve_file(path: &Path) -> Response {
    match std::fs::read(path) {
        Ok(body) => Response::ok(content_type(path), body),
        Err(_) => Response::error(404, "File not found", "Nothing matches the given URI"),
    }
}

/// Maps a URL path into the served directory, ignoring `.` and `..` components
fn translate_path(root: &Path, url_path: &str) -> PathBuf {
    url_path
        .split('/')
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .fold(root.to_path_buf(), |path, component| path.join(component))
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = (bytes[i] == b'%')
            .then(|| s.get(i + 1..i + 3))
            .flatten()
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match escaped {
            Some(byte) => {
                decoded.push(byte);
                i += 3;
            }
            None => {
                decoded.push(bytes[i]);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn directory_listing(path: &Path, display_path: &str) -> Option<String> {
    let mut entries: Vec<(String, bool)> = std::fs::read_dir(path)
        .ok()?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let is_dir = entry.file_type().ok()?.is_dir();
            Some((entry.file_name().to_string_lossy().into_owned(), is_dir))
        })
        .collect();
    entries.sort_by_key(|(name, _)| name.to_lowercase());

    let title = format!("Directory listing for {}", html_escape(display_path));
    let mut body = format!(
        "<!DOCTYPE HTML>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{title}</title>\n</head>\n<body>\n<h1>{title}</h1>\n<hr>\n<ul>\n"
    );
    for (name, is_dir) in entries {
        let name = if is_dir { format!("{name}/") } else { name };
        let escaped = html_escape(&name);
        let _ = writeln!(body, "<li><a href=\"{escaped}\">{escaped}</a></li>");
    }
    body.push_str("</ul>\n<hr>\n</body>\n</html>\n");
    Some(body)
}

fn content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "html" | "htm" => "text/html",
        "txt" | "log" | "py" => "text/plain",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pcap" => "application/vnd.tcpdump.pcap",
        _ => "application/octet-stream",
    }
}

/// The emulated clock starts at the Unix epoch
fn civil_time(elapsed: Duration) -> (u64, u64, u64, u64) {
    let secs = elapsed.as_secs();
    (
        1 + secs / 86400,
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
    )
}

fn http_date(elapsed: Duration) -> String {
    const WEEKDAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
    let (day, hours, minutes, seconds) = civil_time(elapsed);
    format!(
        "{}, {day:02} Jan 1970 {hours:02}:{minutes:02}:{seconds:02} GMT",
        WEEKDAYS[((day - 1) % 7) as usize]
    )
}

fn log_date(elapsed: Duration) -> String {
    let (day, hours, minutes, seconds) = civil_time(elapsed);
    format!("{day:02}/Jan/1970 {hours:02}:{minutes:02}:{seconds:02}")
}

#[derive(Parser, Debug)]
#[command(name = "curl", about = "Transfers a URL")]
struct CurlArgs {
    /// Silent mode
    #[arg(short = 's', long = "silent")]
    silent: bool,
    /// Show errors even when silent
    #[arg(short = 'S', long = "show-error")]
    show_error: bool,
    /// Write the body to FILE instead of stdout
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<String>,
    /// Maximum time allowed for the transfer, in seconds
    #[arg(short = 'm', long = "max-time", value_name = "SECS")]
    max_time: Option<f64>,
    /// Print information after the transfer (supports %{http_code}, %{time_total},
    /// %{size_download} and %{speed_download})
    #[arg(short = 'w', long = "write-out", value_name = "FORMAT")]
    write_out: Option<String>,
    /// Fetch the headers only
    #[arg(short = 'I', long = "head")]
    head: bool,
    url: String,
}

#[derive(Debug, PartialEq)]
struct Url<'a> {
    host: &'a str,
    port: u16,
    path: &'a str,
}

fn parse_url(url: &str) -> Result<Url<'_>, (i32, String)> {
    let rest = match url.split_once("://") {
        Some(("http", rest)) => rest,
        Some((scheme, _)) => {
            return Err((1, format!("Protocol \"{scheme}\" not supported")));
        }
        None => url,
    };

    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };

    let (host, port) = match authority.split_once(':') {
        Some((host, port)) => (
            host,
            port.parse()
                .map_err(|_| (3, "URL using bad/illegal format or missing URL".to_string()))?,
        ),
        None => (authority, 80),
    };

    if host.is_empty() {
        return Err((3, "URL using bad/illegal format or missing URL".to_string()));
    }

    Ok(Url { host, port, path })
}

/// What came back from the server
struct Fetched {
    status: u16,
    headers: String,
    body: Vec<u8>,
}

enum FetchError {
    Connect(TransportError),
    TimedOut { connecting: bool, received: usize },
    Receive(TransportError),
    Malformed,
}

pub fn curl(invocation: Invocation) -> ProgramFuture {
    async move {
        let args: CurlArgs = match invocation.parse_args() {
            Ok(args) => args,
            Err(status) => return status,
        };

        let io = &invocation.io;
        let report_error = |code: i32, message: &str| {
            if !args.silent || args.show_error {
                io.errln(&format!("curl: ({code}) {message}"));
            }
            code
        };

        let url = match parse_url(&args.url) {
            Ok(url) => url,
            Err((code, message)) => return report_error(code, &message),
        };

        let Some(ip) = invocation.env.resolve(url.host) else {
            return report_error(6, &format!("Could not resolve host: {}", url.host));
        };

        let max_time = match args.max_time.map(Duration::try_from_secs_f64) {
            Some(Ok(max_time)) => Some(max_time),
            Some(Err(_)) => return report_error(2, "option -m: expected a proper numerical parameter"),
            None => None,
        };

        let start = Instant::now();
        let deadline = max_time.map(|max_time| start + max_time);
        let method = if args.head { "HEAD" } else { "GET" };
        let request = format!(
            "{method} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {CURL_USER_AGENT}\r\nAccept: */*\r\n\r\n",
            url.path, url.host
        );

        let fetched = fetch(&invocation, SocketAddrV4::new(ip, url.port), &request, deadline).await;
        let elapsed = start.elapsed();
        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(FetchError::Connect(e)) => {
                return report_error(
                    7,
                    &format!(
                        "Failed to connect to {} port {} after {} ms: {e}",
                        url.host,
                        url.port,
                        elapsed.as_millis()
                    ),
                );
            }
            Err(FetchError::TimedOut { connecting: true, .. }) => {
                return report_error(
                    28,
                    &format!("Connection timed out after {} milliseconds", elapsed.as_millis()),
                );
            }
            Err(FetchError::TimedOut { received, .. }) => {
                return report_error(
                    28,
                    &format!(
                        "Operation timed out after {} milliseconds with {received} bytes received",
                        elapsed.as_millis()
                    ),
                );
            }
            Err(FetchError::Receive(e)) => {
                return report_error(56, &format!("Recv failure: {e}"));
            }
            Err(FetchError::Malformed) => {
                return report_error(8, "Weird server reply");
            }
        };

        let payload = if args.head {
            fetched.headers.as_bytes().to_vec()
        } else {
            fetched.body
        };

        match &args.output {
            Some(file) => {
                if std::fs::write(invocation.env.path(file), &payload).is_err() {
                    return report_error(23, "Failure writing output to destination");
                }
            }
            None => io.out(&String::from_utf8_lossy(&payload)),
        }

        if !args.silent {
            print_progress(io, payload.len(), elapsed);
        }

        if let Some(format) = &args.write_out {
            io.out(&write_out(format, fetched.status, payload.len(), elapsed));
        }

        0
    }
    .boxed()
}

async fn fetch(
    invocation: &Invocation,
    remote: SocketAddrV4,
    request: &str,
    deadline: Option<Instant>,
) -> Result<Fetched, FetchError> {
    let far_future = Instant::now() + Duration::from_secs(86400 * 365);
    let deadline = deadline.unwrap_or(far_future);

    let stream = match tokio::time::timeout_at(deadline, TcpStream::connect(&invocation.node, remote)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(FetchError::Connect(e)),
        Err(_) => {
            return Err(FetchError::TimedOut {
                connecting: true,
                received: 0,
            });
        }
    };

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(FetchError::Receive)?;

    let mut received = Vec::new();
    let mut buf = vec![0; READ_CHUNK];
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => received.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => return Err(FetchError::Receive(e)),
            Err(_) => {
                return Err(FetchError::TimedOut {
                    connecting: false,
                    received: received.len(),
                });
            }
        }
    }

    parse_response(&received).ok_or(FetchError::Malformed)
}

fn parse_response(received: &[u8]) -> Option<Fetched> {
    let header_end = received.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let headers = String::from_utf8_lossy(&received[..header_end]).into_owned();
    let status = headers
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()?;

    Some(Fetched {
        status,
        headers,
        body: received[header_end..].to_vec(),
    })
}

/// Sizes and speeds in curl's five-character progress meter columns
fn meter_size(n: u64) -> String {
    const MB: u64 = 1024 * 1024;
    if n < 100_000 {
        format!("{n:>5}")
    } else if n < 10_000 * 1024 {
        format!("{:>4}k", n / 1024)
    } else if n < 100 * MB {
        format!("{:>2}.{}M", n / MB, (n % MB) * 10 / MB)
    } else {
        format!("{:>4}M", n / MB)
    }
}

fn meter_time(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs == 0 {
        "--:--:--".to_string()
    } else {
        format!("{:>2}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
    }
}

fn print_progress(io: &Io, size: usize, elapsed: Duration) {
    let speed = if elapsed.is_zero() {
        size as u64
    } else {
        (size as f64 / elapsed.as_secs_f64()) as u64
    };
    let size = meter_size(size as u64);
    let speed = meter_size(speed);
    let time = meter_time(elapsed);

    io.errln("  % Total    % Received % Xferd  Average Speed   Time    Time     Time  Current");
    io.errln("                                 Dload  Upload   Total   Spent    Left  Speed");
    io.errln(&format!(
        "100 {size}  100 {size}    0     0  {speed}      0 {time} {time} --:--:-- {speed}"
    ));
}

fn write_out(format: &str, status: u16, size: usize, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    let speed = if secs > 0.0 { size as f64 / secs } else { 0.0 };
    format
        .replace("%{http_code}", &format!("{status:03}"))
        .replace("%{response_code}", &format!("{status:03}"))
        .replace("%{time_total}", &format!("{secs:.6}"))
        .replace("%{size_download}", &size.to_string())
        .replace("%{speed_download}", &format!("{}", speed as u64))
        .replace("\\n", "\n")
        .replace("\\t", "\t")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_url() {
        assert_eq!(
            parse_url("http://h4:8080/files/a.txt"),
            Ok(Url {
                host: "h4",
                port: 8080,
                path: "/files/a.txt"
            })
        );
        assert_eq!(
            parse_url("10.0.0.4"),
            Ok(Url {
                host: "10.0.0.4",
                port: 80,
                path: "/"
            })
        );
        assert_eq!(
            parse_url("https://h4/"),
            Err((1, "Protocol \"https\" not supported".to_string()))
        );
    }

    #[test]
    fn test_translate_path() {
        let root = Path::new("/srv");
        assert_eq!(translate_path(root, "/a/b.txt"), Path::new("/srv/a/b.txt"));
        assert_eq!(translate_path(root, "/../../etc/passwd"), Path::new("/srv/etc/passwd"));
        assert_eq!(percent_decode("/my%20file.txt"), "/my file.txt");
        assert_eq!(percent_decode("/100%"), "/100%");
    }

    #[test]
    fn test_serve_files_and_listing() {
        let root = std::env::temp_dir().join(format!("http-server-test-{}", std::process::id()));
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("hello.txt"), "hello world\n").unwrap();

        let response = respond(&root, "GET /hello.txt HTTP/1.1");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello world\n");
        assert!(response.headers.contains(&("Content-type", "text/plain".to_string())));

        let response = respond(&root, "GET / HTTP/1.1");
        assert_eq!(response.status, 200);
        let listing = String::from_utf8(response.body).unwrap();
        assert!(listing.contains("<title>Directory listing for /</title>"));
        assert!(listing.contains("<li><a href=\"hello.txt\">hello.txt</a></li>"));
        assert!(listing.contains("<li><a href=\"sub/\">sub/</a></li>"));

        let response = respond(&root, "GET /sub HTTP/1.1");
        assert_eq!(response.status, 301);
        assert_eq!(response.headers[0], ("Location", "/sub/".to_string()));

        let response = respond(&root, "GET /missing HTTP/1.1");
        assert_eq!(response.status, 404);

        let response = respond(&root, "HEAD /hello.txt HTTP/1.1");
        let bytes = String::from_utf8(response.to_bytes(Duration::from_secs(5))).unwrap();
        assert!(bytes.starts_with("HTTP/1.0 200 OK\r\nServer: SimpleHTTP/0.6"));
        assert!(bytes.contains("Date: Thu, 01 Jan 1970 00:00:05 GMT\r\n"));
        assert!(bytes.ends_with("\r\n\r\n"));

        assert_eq!(respond(&root, "POST / HTTP/1.1").status, 501);
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_parse_response() {
        let fetched = parse_response(b"HTTP/1.0 404 File not found\r\nServer: x\r\n\r\nbody").unwrap();
        assert_eq!(fetched.status, 404);
        assert_eq!(fetched.body, b"body");
        assert!(parse_response(b"garbage").is_none());
    }

    #[test]
    fn test_progress_columns() {
        assert_eq!(meter_size(1234), " 1234");
        assert_eq!(meter_size(616_448), " 602k");
        assert_eq!(meter_size(15 * 1024 * 1024), "15.0M");
        assert_eq!(meter_time(Duration::from_millis(300)), "--:--:--");
        assert_eq!(meter_time(Duration::from_secs(61)), " 0:01:01");
        assert_eq!(
            write_out("%{http_code} %{size_download}\\n", 200, 10, Duration::from_secs(1)),
            "200 10\n"
        );
    }
}
