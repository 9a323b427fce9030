use std::ffi::OsString;
use std::io::{self, BufRead, ErrorKind, Write};
use std::time::Duration;

use rusqlite::fallible_iterator::FallibleIterator;
use rusqlite::types::Value;
use rusqlite::{Batch, Connection, Statement};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use vttp_ext_http::TableOptions;
use vttp_types::SqliteValue;

const DEFAULT_DB_PATH: &str = ":memory:";
const PROMPT_PRIMARY: &str = "vttp> ";
const PROMPT_CONTINUATION: &str = " ...> ";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CliOptions {
    db_path: Option<String>,
    command: Option<String>,
    timeout_ms: Option<u64>,
    verbose: bool,
    show_help: bool,
}

fn main() {
    let args: Vec<OsString> = std::env::args_os().collect();
    init_logging(args.iter().any(|arg| arg == "-v" || arg == "--verbose"));

    let code = run(
        args,
        &mut io::stdin().lock(),
        &mut io::stdout(),
        &mut io::stderr(),
    );
    if code != 0 {
        std::process::exit(code);
    }
}

/// `RUST_LOG` wins; otherwise warnings only, or debug for the vttp crates
/// with `--verbose`.
fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("warn,vttp_ext_http=debug,vttp_sqlite=debug,vttp=debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn run<I, R, W, E>(args: I, input: &mut R, out: &mut W, err: &mut E) -> i32
where
    I: IntoIterator<Item = OsString>,
    R: BufRead,
    W: Write,
    E: Write,
{
    let options = match parse_args(args) {
        Ok(options) => options,
        Err(message) => {
            let _ = writeln!(err, "error: {message}");
            let _ = write_usage(err);
            return 2;
        }
    };

    if options.show_help {
        return i32::from(write_usage(out).is_err());
    }

    let connection = match open_connection(&options) {
        Ok(connection) => connection,
        Err(error) => {
            let _ = writeln!(err, "error: {error}");
            return 1;
        }
    };

    match options.command {
        Some(sql) => i32::from(!execute_sql(&connection, &sql, out, err)),
        None => run_repl(&connection, input, out, err),
    }
}

/// Open the database and register `vttp` with shell-wide fetch defaults.
fn open_connection(options: &CliOptions) -> rusqlite::Result<Connection> {
    let path = options.db_path.as_deref().unwrap_or(DEFAULT_DB_PATH);
    let connection = Connection::open(path)?;

    let mut defaults = TableOptions::default();
    if let Some(millis) = options.timeout_ms {
        defaults.fetch.timeout = Duration::from_millis(millis);
    }
    vttp_sqlite::register_module_with_config(&connection, defaults)?;
    debug!(db = path, timeout_ms = options.timeout_ms, "shell connection ready");
    Ok(connection)
}

fn parse_args<I>(args: I) -> Result<CliOptions, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut options = CliOptions::default();
    let mut args = args
        .into_iter()
        .skip(1)
        .map(|arg| arg.to_string_lossy().into_owned());

    while let Some(arg) = args.next() {
        // `--flag=value` and `--flag value` are equivalent.
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with('-') => (flag, Some(value.to_owned())),
            _ => (arg.as_str(), None),
        };

        match flag {
            "-h" | "--help" => options.show_help = true,
            "-v" | "--verbose" => options.verbose = true,
            "-c" | "--command" => {
                let sql = flag_value(flag, inline, &mut args)?;
                if options.command.replace(sql).is_some() {
                    return Err(String::from("`-c/--command` may only be given once"));
                }
            }
            "--timeout-ms" => {
                let raw = flag_value(flag, inline, &mut args)?;
                options.timeout_ms = Some(parse_timeout(&raw)?);
            }
            _ if flag.starts_with('-') => return Err(format!("unknown option `{flag}`")),
            _ => {
                if options.db_path.replace(arg.clone()).is_some() {
                    return Err(String::from("expected at most one DB path"));
                }
            }
        }
    }

    Ok(options)
}

fn flag_value(
    flag: &str,
    inline: Option<String>,
    rest: &mut impl Iterator<Item = String>,
) -> Result<String, String> {
    inline
        .or_else(|| rest.next())
        .ok_or_else(|| format!("missing value for `{flag}`"))
}

fn parse_timeout(raw: &str) -> Result<u64, String> {
    raw.parse::<u64>()
        .ok()
        .filter(|millis| *millis > 0)
        .ok_or_else(|| format!("`--timeout-ms` expects a positive integer, got `{raw}`"))
}

enum Flow {
    Continue,
    Quit,
}

/// Line-at-a-time REPL state: buffers SQL until a statement is complete.
struct Shell<'c> {
    connection: &'c Connection,
    pending: String,
}

impl<'c> Shell<'c> {
    fn new(connection: &'c Connection) -> Self {
        Self {
            connection,
            pending: String::new(),
        }
    }

    fn prompt(&self) -> &'static str {
        if self.pending.is_empty() {
            PROMPT_PRIMARY
        } else {
            PROMPT_CONTINUATION
        }
    }

    fn feed<W, E>(&mut self, line: &str, out: &mut W, err: &mut E) -> io::Result<Flow>
    where
        W: Write,
        E: Write,
    {
        if self.pending.is_empty() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return Ok(Flow::Continue);
            }
            if trimmed.starts_with('.') {
                return self.dot_command(trimmed, out, err);
            }
        } else {
            self.pending.push('\n');
        }

        self.pending.push_str(line);
        if statement_complete(&self.pending) {
            self.flush(out, err);
        }
        Ok(Flow::Continue)
    }

    fn dot_command<W, E>(&self, line: &str, out: &mut W, err: &mut E) -> io::Result<Flow>
    where
        W: Write,
        E: Write,
    {
        let (command, arg) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(command, arg)| (command, arg.trim()));
        match command {
            ".quit" | ".exit" => return Ok(Flow::Quit),
            ".help" => write_repl_help(out)?,
            ".read" if arg.is_empty() => writeln!(err, "error: usage: .read FILE")?,
            ".read" => match std::fs::read_to_string(arg) {
                Ok(sql) => {
                    execute_sql(self.connection, &sql, out, err);
                }
                Err(error) => writeln!(err, "error: cannot read `{arg}`: {error}")?,
            },
            _ => writeln!(err, "error: unknown command `{command}`; try .help")?,
        }
        Ok(Flow::Continue)
    }

    /// Execute whatever is buffered, complete or not.
    fn flush<W, E>(&mut self, out: &mut W, err: &mut E)
    where
        W: Write,
        E: Write,
    {
        let sql = std::mem::take(&mut self.pending);
        if !sql.trim().is_empty() {
            execute_sql(self.connection, sql.trim(), out, err);
        }
    }
}

fn run_repl<R, W, E>(connection: &Connection, input: &mut R, out: &mut W, err: &mut E) -> i32
where
    R: BufRead,
    W: Write,
    E: Write,
{
    let mut shell = Shell::new(connection);
    let mut line = String::new();

    loop {
        if write!(out, "{}", shell.prompt())
            .and_then(|()| out.flush())
            .is_err()
        {
            return 1;
        }

        line.clear();
        match input.read_line(&mut line) {
            Ok(0) => {
                shell.flush(out, err);
                return 0;
            }
            Ok(_) => {}
            Err(error) if error.kind() == ErrorKind::Interrupted => {
                shell.pending.clear();
                let _ = writeln!(out);
                continue;
            }
            Err(error) => {
                let _ = writeln!(err, "error: {error}");
                return 1;
            }
        }

        match shell.feed(line.trim_end_matches(['\n', '\r']), out, err) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => return 0,
            Err(_) => return 1,
        }
    }
}

/// Run every statement in `sql`, printing result rows. Stops at the first
/// failing statement.
fn execute_sql<W, E>(connection: &Connection, sql: &str, out: &mut W, err: &mut E) -> bool
where
    W: Write,
    E: Write,
{
    let mut batch = Batch::new(connection, sql);
    loop {
        let outcome = match batch.next() {
            Ok(Some(mut statement)) => write_rows(&mut statement, out),
            Ok(None) => return true,
            Err(error) => Err(RowsError::Sql(error)),
        };
        let message = match outcome {
            Ok(()) => continue,
            Err(RowsError::Sql(error)) => error.to_string(),
            Err(RowsError::Io(error)) => format!("failed writing query results: {error}"),
        };
        let _ = writeln!(err, "error: {message}");
        return false;
    }
}

enum RowsError {
    Sql(rusqlite::Error),
    Io(io::Error),
}

fn write_rows<W>(statement: &mut Statement<'_>, out: &mut W) -> Result<(), RowsError>
where
    W: Write,
{
    let width = statement.column_count();
    let mut rows = statement.query([]).map_err(RowsError::Sql)?;
    while let Some(row) = rows.next().map_err(RowsError::Sql)? {
        let values = (0..width)
            .map(|i| row.get::<_, Value>(i).map(scalar))
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(RowsError::Sql)?;
        writeln!(out, "{}", format_row(&values)).map_err(RowsError::Io)?;
    }
    Ok(())
}

fn scalar(value: Value) -> SqliteValue {
    match value {
        Value::Null => SqliteValue::Null,
        Value::Integer(i) => SqliteValue::Integer(i),
        Value::Real(f) => SqliteValue::Float(f),
        Value::Text(s) => SqliteValue::Text(s),
        Value::Blob(b) => SqliteValue::Blob(b),
    }
}

fn format_row(values: &[SqliteValue]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Code,
    LineComment,
    BlockComment,
    /// Inside a quoted literal or identifier; holds the closing byte.
    Quoted(u8),
}

/// Whether `buffer` ends in a `;` that sits outside quotes and comments.
fn statement_complete(buffer: &str) -> bool {
    let mut scan = Scan::Code;
    let mut last_code_byte = None;
    let mut bytes = buffer.bytes().peekable();

    while let Some(b) = bytes.next() {
        scan = match scan {
            Scan::Code => match b {
                b'-' if bytes.peek() == Some(&b'-') => {
                    bytes.next();
                    Scan::LineComment
                }
                b'/' if bytes.peek() == Some(&b'*') => {
                    bytes.next();
                    Scan::BlockComment
                }
                _ if b.is_ascii_whitespace() => Scan::Code,
                _ => {
                    last_code_byte = Some(b);
                    match b {
                        b'\'' | b'"' | b'`' => Scan::Quoted(b),
                        b'[' => Scan::Quoted(b']'),
                        _ => Scan::Code,
                    }
                }
            },
            Scan::LineComment if b == b'\n' => Scan::Code,
            Scan::BlockComment if b == b'*' && bytes.peek() == Some(&b'/') => {
                bytes.next();
                Scan::Code
            }
            // A doubled closing quote is an escaped quote.
            Scan::Quoted(close) if b == close => {
                if bytes.peek() == Some(&close) {
                    bytes.next();
                    scan
                } else {
                    Scan::Code
                }
            }
            other => other,
        };
    }

    matches!(scan, Scan::Code | Scan::LineComment) && last_code_byte == Some(b';')
}

fn write_usage<W>(out: &mut W) -> io::Result<()>
where
    W: Write,
{
    writeln!(
        out,
        "Usage: vttp [DB_PATH] [-c|--command SQL] [--timeout-ms N] [-v|--verbose]\n\
         \n\
         SQL shell with the `vttp` virtual table module registered.\n\
         DB_PATH defaults to an in-memory database. RUST_LOG overrides the log filter.\n\
         \n\
         Example:\n\
         \n\
         vttp -c \"CREATE VIRTUAL TABLE todos USING vttp(id int, title text, \\\n\
         \x20        url text default 'https://jsonplaceholder.typicode.com/todos'); \\\n\
         \x20        SELECT id, title FROM todos LIMIT 3;\"\n",
    )
}

fn write_repl_help<W>(out: &mut W) -> io::Result<()>
where
    W: Write,
{
    writeln!(
        out,
        ".help          this message\n\
         .read FILE     run the SQL in FILE\n\
         .quit, .exit   leave the shell\n\
         \n\
         SQL runs once a statement ends with `;`.\n",
    )
}
