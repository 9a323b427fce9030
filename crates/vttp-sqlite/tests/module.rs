//! End-to-end scans through SQLite with a stub fetcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode};
use vttp_error::{FetchError, Result, VttpError};
use vttp_ext_http::{FetchConfig, ResourceFetcher, TableOptions};
use vttp_types::cx::Cx;

const TODOS: &str = "https://example.test/todos";
const ONE_TODO: &str = r#"[{"id":1,"userId":1,"title":"a","completed":true}]"#;

/// Serves a fixed sequence of responses per URL; the last one repeats.
#[derive(Debug, Default)]
struct StubFetcher {
    routes: HashMap<String, Vec<std::result::Result<String, FetchError>>>,
    calls: AtomicUsize,
}

impl StubFetcher {
    fn with(mut self, url: &str, response: std::result::Result<&str, FetchError>) -> Self {
        self.routes
            .entry(url.to_owned())
            .or_default()
            .push(response.map(str::to_owned));
        self
    }

    fn body(url: &str, body: &str) -> Self {
        Self::default().with(url, Ok(body))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ResourceFetcher for StubFetcher {
    fn fetch(&self, _cx: &Cx, url: &str, _config: &FetchConfig) -> Result<Vec<u8>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let responses = self.routes.get(url).ok_or_else(|| FetchError::Unreachable {
            url: url.to_owned(),
            detail: "no route".to_owned(),
        })?;
        let response = &responses[n.min(responses.len() - 1)];
        response
            .clone()
            .map(String::into_bytes)
            .map_err(VttpError::from)
    }
}

fn connect(fetcher: &Arc<StubFetcher>) -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    let fetcher: Arc<dyn ResourceFetcher> = Arc::clone(fetcher) as Arc<dyn ResourceFetcher>;
    vttp_sqlite::register_module_with_fetcher(&conn, fetcher, TableOptions::default()).unwrap();
    conn
}

fn todos(conn: &Connection, completed: &str) {
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE todos USING vttp(
            id int,
            userId int,
            title text,
            completed {completed},
            url text default '{TODOS}'
        )"
    ))
    .unwrap();
}

fn rows(conn: &Connection, sql: &str) -> Vec<Vec<Value>> {
    let mut stmt = conn.prepare(sql).unwrap();
    let width = stmt.column_count();
    stmt.query_map([], |row| (0..width).map(|i| row.get::<_, Value>(i)).collect())
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap()
}

fn text(s: &str) -> Value {
    Value::Text(s.to_owned())
}

#[test]
fn completed_declared_text_reads_true() {
    let fetcher = Arc::new(StubFetcher::body(TODOS, ONE_TODO));
    let conn = connect(&fetcher);
    todos(&conn, "text");

    let got = rows(
        &conn,
        "SELECT id, userId, title, completed, typeof(id), typeof(completed) FROM todos",
    );
    assert_eq!(
        got,
        vec![vec![
            Value::Integer(1),
            Value::Integer(1),
            text("a"),
            text("true"),
            text("integer"),
            text("text"),
        ]]
    );
}

#[test]
fn completed_declared_int_reads_one() {
    let fetcher = Arc::new(StubFetcher::body(TODOS, ONE_TODO));
    let conn = connect(&fetcher);
    todos(&conn, "int");

    let got = rows(&conn, "SELECT completed, typeof(completed) FROM todos");
    assert_eq!(got, vec![vec![Value::Integer(1), text("integer")]]);
}

#[test]
fn http_404_fails_the_query() {
    let fetcher = Arc::new(StubFetcher::default().with(
        TODOS,
        Err(FetchError::HttpStatus {
            url: TODOS.to_owned(),
            status: 404,
        }),
    ));
    let conn = connect(&fetcher);
    todos(&conn, "text");

    let err = conn
        .prepare("SELECT * FROM todos")
        .and_then(|mut stmt| stmt.query([])?.next().map(|_| ()))
        .unwrap_err();
    assert!(err.to_string().contains("HTTP status 404"), "{err}");
}

#[test]
fn bare_object_is_a_single_row() {
    let fetcher = Arc::new(StubFetcher::body(TODOS, "{}"));
    let conn = connect(&fetcher);
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE t USING vttp(
            id int default 42,
            title text,
            url text default '{TODOS}'
        )"
    ))
    .unwrap();

    let got = rows(&conn, "SELECT id, title FROM t");
    assert_eq!(got, vec![vec![Value::Integer(42), Value::Null]]);
}

#[test]
fn url_column_is_hidden_but_readable() {
    let fetcher = Arc::new(StubFetcher::body(TODOS, ONE_TODO));
    let conn = connect(&fetcher);
    todos(&conn, "text");

    let stmt = conn.prepare("SELECT * FROM todos").unwrap();
    assert_eq!(
        stmt.column_names(),
        ["id", "userId", "title", "completed"]
    );
    let got = rows(&conn, "SELECT url FROM todos");
    assert_eq!(got, vec![vec![text(TODOS)]]);
}

#[test]
fn rowids_start_at_zero_in_fetch_order() {
    let fetcher = Arc::new(StubFetcher::body(
        TODOS,
        r#"[{"id":9},{"id":3},{"id":5},{"id":1}]"#,
    ));
    let conn = connect(&fetcher);
    todos(&conn, "text");

    let got = rows(&conn, "SELECT rowid, id FROM todos");
    let expected: Vec<Vec<Value>> = [(0, 9), (1, 3), (2, 5), (3, 1)]
        .into_iter()
        .map(|(rowid, id)| vec![Value::Integer(rowid), Value::Integer(id)])
        .collect();
    assert_eq!(got, expected);
}

#[test]
fn host_evaluates_where_and_order_by() {
    let fetcher = Arc::new(StubFetcher::body(
        TODOS,
        r#"[
            {"id":1,"title":"b","completed":true},
            {"id":2,"title":"c","completed":false},
            {"id":3,"title":"a","completed":true}
        ]"#,
    ));
    let conn = connect(&fetcher);
    todos(&conn, "text");

    let got = rows(
        &conn,
        "SELECT title FROM todos WHERE completed = 'true' ORDER BY title",
    );
    assert_eq!(got, vec![vec![text("a")], vec![text("b")]]);
}

#[test]
fn same_field_as_int_and_text() {
    let fetcher = Arc::new(StubFetcher::body(
        TODOS,
        r#"[{"completed":true},{"completed":false}]"#,
    ));
    let conn = connect(&fetcher);
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE t USING vttp(
            done_int int generated always as (completed),
            done_text text generated always as (completed),
            url = '{TODOS}'
        )"
    ))
    .unwrap();

    let got = rows(&conn, "SELECT done_int, done_text FROM t");
    assert_eq!(
        got,
        vec![
            vec![Value::Integer(1), text("true")],
            vec![Value::Integer(0), text("false")],
        ]
    );
}

#[test]
fn repeated_reads_are_stable() {
    let fetcher = Arc::new(StubFetcher::body(TODOS, ONE_TODO));
    let conn = connect(&fetcher);
    todos(&conn, "text");

    let got = rows(&conn, "SELECT completed, completed, title, title FROM todos");
    assert_eq!(got[0][0], got[0][1]);
    assert_eq!(got[0][2], got[0][3]);
}

#[test]
fn scans_share_one_fetch() {
    let fetcher = Arc::new(StubFetcher::body(
        TODOS,
        r#"[{"id":1},{"id":2},{"id":3}]"#,
    ));
    let conn = connect(&fetcher);
    todos(&conn, "text");

    assert_eq!(rows(&conn, "SELECT count(*) FROM todos"), vec![vec![Value::Integer(3)]]);
    assert_eq!(
        rows(&conn, "SELECT count(*) FROM todos a, todos b"),
        vec![vec![Value::Integer(9)]]
    );
    assert_eq!(fetcher.calls(), 1);
}

#[test]
fn failed_fetch_is_retried_by_the_next_scan() {
    let fetcher = Arc::new(
        StubFetcher::default()
            .with(
                TODOS,
                Err(FetchError::Timeout {
                    url: TODOS.to_owned(),
                }),
            )
            .with(TODOS, Ok(ONE_TODO)),
    );
    let conn = connect(&fetcher);
    todos(&conn, "text");

    let first = conn.query_row("SELECT count(*) FROM todos", [], |row| row.get::<_, i64>(0));
    assert!(first.unwrap_err().to_string().contains("timed out"));

    let second: i64 = conn
        .query_row("SELECT count(*) FROM todos", [], |row| row.get(0))
        .unwrap();
    assert_eq!(second, 1);
    assert_eq!(fetcher.calls(), 2);
}

#[test]
fn malformed_payload_is_a_decode_error() {
    let fetcher = Arc::new(StubFetcher::body(TODOS, "[{\"id\": 1"));
    let conn = connect(&fetcher);
    todos(&conn, "text");

    let err = conn
        .query_row("SELECT count(*) FROM todos", [], |row| row.get::<_, i64>(0))
        .unwrap_err();
    assert!(err.to_string().contains("invalid json payload"), "{err}");
}

#[test]
fn missing_source_fails_create() {
    let fetcher = Arc::new(StubFetcher::default());
    let conn = connect(&fetcher);

    let err = conn
        .execute_batch("CREATE VIRTUAL TABLE t USING vttp(id int, title text)")
        .unwrap_err();
    assert!(err.to_string().contains("no data source configured"), "{err}");
    assert_eq!(fetcher.calls(), 0);
}

#[test]
fn create_does_not_fetch() {
    let fetcher = Arc::new(StubFetcher::body(TODOS, ONE_TODO));
    let conn = connect(&fetcher);
    todos(&conn, "text");
    assert_eq!(fetcher.calls(), 0);
}

#[test]
fn writes_are_rejected() {
    let fetcher = Arc::new(StubFetcher::body(TODOS, ONE_TODO));
    let conn = connect(&fetcher);
    todos(&conn, "text");

    assert!(
        conn.execute("INSERT INTO todos(id, title) VALUES (2, 'b')", [])
            .is_err()
    );
    assert!(conn.execute("DELETE FROM todos", []).is_err());
}

#[test]
fn records_pointer_and_ndjson_options() {
    let feed = "https://example.test/feed";
    let lines = "https://example.test/lines";
    let fetcher = Arc::new(
        StubFetcher::default()
            .with(feed, Ok(r#"{"data":{"items":[{"n":1},{"n":2}]}}"#))
            .with(lines, Ok("{\"n\":10}\n\n{\"n\":20}\n")),
    );
    let conn = connect(&fetcher);
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE feed USING vttp(n int, url = '{feed}', records = '/data/items');
         CREATE VIRTUAL TABLE lines USING vttp(n int, url = '{lines}', format = ndjson);"
    ))
    .unwrap();

    assert_eq!(
        rows(&conn, "SELECT sum(n) FROM feed"),
        vec![vec![Value::Integer(3)]]
    );
    assert_eq!(
        rows(&conn, "SELECT sum(n) FROM lines"),
        vec![vec![Value::Integer(30)]]
    );
}

#[test]
fn nested_values_read_as_json_text() {
    let fetcher = Arc::new(StubFetcher::body(
        TODOS,
        r#"[{"tags":["x","y"],"geo":{"lat":"-37.3"}}]"#,
    ));
    let conn = connect(&fetcher);
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE t USING vttp(
            tags text,
            lat real generated always as (geo -> 'lat'),
            url = '{TODOS}'
        )"
    ))
    .unwrap();

    let got = rows(&conn, "SELECT tags, lat FROM t");
    assert_eq!(got, vec![vec![text(r#"["x","y"]"#), Value::Real(-37.3)]]);
}

#[test]
fn drop_table_releases_module_table() {
    let fetcher = Arc::new(StubFetcher::body(TODOS, ONE_TODO));
    let conn = connect(&fetcher);
    todos(&conn, "text");
    conn.execute_batch("DROP TABLE todos").unwrap();
    assert!(conn.prepare("SELECT * FROM todos").is_err());
}

#[test]
fn register_module_creates_tables_without_network() {
    let conn = Connection::open_in_memory().unwrap();
    vttp_sqlite::register_module(&conn).unwrap();
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE todos USING vttp(id int, url text default '{TODOS}')"
    ))
    .unwrap();
    let stmt = conn.prepare("SELECT id FROM todos").unwrap();
    assert_eq!(stmt.column_count(), 1);
}

#[test]
fn suffixed_duplicate_names_avoid_declared_ones() {
    let fetcher = Arc::new(StubFetcher::body(TODOS, r#"[{"a":5}]"#));
    let conn = connect(&fetcher);
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE t USING vttp(a int, a int, \"a:1\" int, url = '{TODOS}')"
    ))
    .unwrap();

    let stmt = conn.prepare("SELECT * FROM t").unwrap();
    assert_eq!(stmt.column_names(), ["a", "a:2", "a:1"]);
    let got = rows(&conn, "SELECT a, \"a:2\", \"a:1\" FROM t");
    assert_eq!(
        got,
        vec![vec![Value::Integer(5), Value::Integer(5), Value::Null]]
    );
}

#[test]
fn failures_keep_their_result_code() {
    let fetcher = Arc::new(StubFetcher::default());
    let conn = connect(&fetcher);
    let err = conn
        .execute_batch("CREATE VIRTUAL TABLE t USING vttp(id int)")
        .unwrap_err();
    assert_eq!(err.sqlite_error_code(), Some(ErrorCode::Unknown));
}

/// Blocks each fetch until released, then honours cancellation.
#[derive(Debug)]
struct GatedFetcher {
    started: mpsc::Sender<()>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl ResourceFetcher for GatedFetcher {
    fn fetch(&self, cx: &Cx, _url: &str, _config: &FetchConfig) -> Result<Vec<u8>> {
        let _ = self.started.send(());
        let _ = self.release.lock().unwrap().recv();
        cx.checkpoint()?;
        Ok(ONE_TODO.as_bytes().to_vec())
    }
}

#[test]
fn interrupt_cancels_a_pending_fetch() {
    let (started_tx, started) = mpsc::channel();
    let (release, release_rx) = mpsc::channel();
    let fetcher = Arc::new(GatedFetcher {
        started: started_tx,
        release: Mutex::new(release_rx),
    });
    let conn = Connection::open_in_memory().unwrap();
    let handle =
        vttp_sqlite::register_module_with_fetcher(&conn, fetcher, TableOptions::default())
            .unwrap();
    todos(&conn, "text");

    let query = thread::spawn(move || {
        let result = conn.query_row("SELECT count(*) FROM todos", [], |row| row.get::<_, i64>(0));
        (conn, result)
    });
    started.recv().unwrap();
    handle.interrupt();
    release.send(()).unwrap();

    let (conn, result) = query.join().unwrap();
    let err = result.unwrap_err();
    assert!(err.to_string().contains("interrupted"), "{err}");
    assert_eq!(err.sqlite_error_code(), Some(ErrorCode::OperationInterrupted));

    // The interrupted fetch was not cached; a later scan fetches again.
    release.send(()).unwrap();
    let count: i64 = conn
        .query_row("SELECT count(*) FROM todos", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
}
