//! Scenario tests against the mock server in [crate::mock]
use std::{fmt::Debug, sync::Arc, time::Duration};

use mywire::{
    CancelOutcome, ConnectionErrorContent, Param, Pool, PoolOptions, ResultHeader, Session,
    SessionState, Value,
    blocking::{BlockingPool, BlockingSession},
    cache::{ParameterMode, RoutineKind},
};

use crate::mock::{BIG_VALUE_LEN, MockConfig, MockServer};

struct Error(Box<dyn std::error::Error + Send>);

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl<E: std::error::Error + 'static + Send> From<E> for Error {
    fn from(value: E) -> Self {
        Error(Box::new(value))
    }
}

async fn server() -> MockServer {
    MockServer::start(MockConfig::default()).await.unwrap()
}

/// Server configurations the protocol scenarios run against
fn variants() -> Vec<MockConfig> {
    vec![
        MockConfig::default(),
        MockConfig {
            deprecate_eof: true,
            ..Default::default()
        },
        MockConfig {
            compress: true,
            ..Default::default()
        },
        MockConfig {
            query_attributes: true,
            ..Default::default()
        },
        MockConfig {
            deprecate_eof: true,
            compress: true,
            query_attributes: true,
            session_track: true,
            ..Default::default()
        },
    ]
}

#[tokio::test]
async fn select_one() -> Result<(), Error> {
    for config in variants() {
        let server = MockServer::start(config.clone()).await?;
        let mut session =
            tokio::time::timeout(Duration::from_secs(2), Session::connect(&server.options()))
                .await??;
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.server_version().major, 8);
        assert_eq!(session.capabilities().deprecate_eof(), config.deprecate_eof);
        assert_eq!(session.capabilities().compression(), config.compress);
        assert_eq!(
            session.capabilities().query_attributes(),
            config.query_attributes
        );

        let mut rows = session.query("SELECT 1").await?;
        assert_eq!(rows.columns().len(), 1);
        assert_eq!(rows.columns()[0].name, "1");
        {
            let row = rows.next().await?.expect("one row");
            assert_eq!(row.get(0)?.as_i64(), Some(1));
        }
        assert!(rows.next().await?.is_none());
        assert_eq!(session.state(), SessionState::Ready);

        let id = session.connection_id();
        session.close().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.log_for(id), ["QUERY SELECT 1", "QUIT"]);
    }
    Ok(())
}

#[tokio::test]
async fn split_payload() -> Result<(), Error> {
    for compress in [false, true] {
        let server = MockServer::start(MockConfig {
            compress,
            ..Default::default()
        })
        .await?;
        let mut session = Session::connect(&server.options()).await?;
        assert_eq!(session.capabilities().compression(), compress);
        let mut rows = session.query("SELECT BIG").await?;
        {
            let row = rows.next().await?.expect("one row");
            let value = row.get(0)?.as_bytes().expect("bytes");
            assert_eq!(value.len(), BIG_VALUE_LEN);
            assert!(value.iter().all(|v| *v == b'x'));
        }
        assert!(rows.next().await?.is_none());

        // The session stays in sync after the split payload
        let mut rows = session.query("SELECT 1").await?;
        assert!(rows.next().await?.is_some());
        assert!(rows.next().await?.is_none());
        session.ping().await?;
    }
    Ok(())
}

#[tokio::test]
async fn session_tracking() -> Result<(), Error> {
    for session_track in [false, true] {
        let server = MockServer::start(MockConfig {
            session_track,
            ..Default::default()
        })
        .await?;
        let mut session = Session::connect(&server.options()).await?;
        assert_eq!(session.capabilities().session_track(), session_track);
        let charset = session.charset();

        let ok = session.execute("USE shop").await?;
        let ok_charset = session.execute("SET NAMES latin1").await?;
        if session_track {
            assert_eq!(ok.schema.as_deref(), Some("shop"));
            assert_eq!(session.database(), Some("shop"));
            assert_eq!(session.charset(), 8);
            assert_eq!(ok_charset.schema, None);
        } else {
            assert_eq!(ok.schema, None);
            assert_eq!(session.database(), None);
            assert_eq!(session.charset(), charset);
        }
        session.ping().await?;
    }
    Ok(())
}

#[tokio::test]
async fn auth_switch_once() -> Result<(), Error> {
    let server = MockServer::start(MockConfig {
        auth_switches: 1,
        ..Default::default()
    })
    .await?;
    let mut session = Session::connect(&server.options()).await?;
    session.ping().await?;
    Ok(())
}

#[tokio::test]
async fn second_auth_switch_fails() -> Result<(), Error> {
    let server = MockServer::start(MockConfig {
        auth_switches: 2,
        ..Default::default()
    })
    .await?;
    let e = Session::connect(&server.options()).await.unwrap_err();
    assert!(
        matches!(e.content(), ConnectionErrorContent::Authentication(_)),
        "{e:?}"
    );
    Ok(())
}

#[tokio::test]
async fn server_error_keeps_session() -> Result<(), Error> {
    let server = server().await;
    let mut session = Session::connect(&server.options()).await?;
    let e = session.execute("FAIL").await.unwrap_err();
    match e.content() {
        ConnectionErrorContent::Mysql { code, status, .. } => {
            assert_eq!(*code, 1064);
            assert_eq!(status, b"42000");
        }
        v => panic!("Unexpected error {v:?}"),
    }
    assert!(!e.is_fatal());
    assert_eq!(session.state(), SessionState::Ready);
    session.ping().await?;

    let e = session.execute("SELECT 1").await.unwrap_err();
    assert!(matches!(e.content(), ConnectionErrorContent::UnexpectedRows));
    let e = session.query("UPDATE t SET a=1").await.map(|_| ()).unwrap_err();
    assert!(matches!(e.content(), ConnectionErrorContent::ExpectedRows));
    session.ping().await?;
    Ok(())
}

#[tokio::test]
async fn drain_after_abandoned_stream() -> Result<(), Error> {
    let server = server().await;
    let mut session = Session::connect(&server.options()).await?;
    {
        let mut rows = session.query("SELECT ROWS 10").await?;
        let row = rows.next().await?.expect("row");
        assert_eq!(row.get(0)?.as_i64(), Some(0));
        assert_eq!(row.get_by_name("nothing")?, Value::Null);
    }
    assert_eq!(session.state(), SessionState::Streaming);
    let ok = session.execute("DO 1").await?;
    assert_eq!(ok.affected_rows, 1);
    assert_eq!(session.state(), SessionState::Ready);

    // Headers can be read by hand as well
    session
        .send_command(mywire::Command::Query("SELECT ROWS 3"))
        .await?;
    assert_eq!(session.read_result_header().await?, ResultHeader::Columns(2));
    let mut n = 0;
    while session.next_row().await?.is_some() {
        n += 1;
    }
    assert_eq!(n, 3);
    Ok(())
}

#[tokio::test]
async fn drop_cancel() -> Result<(), Error> {
    let server = server().await;
    let mut session = Session::connect(&server.options()).await?;

    for c in 0.. {
        session.set_cancel_count(None);
        session.drain().await?;
        session.set_cancel_count(Some(c));
        let r = match session.query("SELECT ROWS 5").await {
            Ok(rows) => rows.map_rows(|row| Ok(row.get(0)?.as_i64())).await,
            Err(e) => Err(e),
        };
        match r {
            Err(e) if matches!(e.content(), ConnectionErrorContent::TestCancelled) => (),
            Ok(v) => {
                assert_eq!(v, [Some(0), Some(1), Some(2), Some(3), Some(4)]);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    for c in 0.. {
        session.set_cancel_count(None);
        session.drain().await?;
        session.set_cancel_count(Some(c));
        match session.prepare("INSERT INTO t VALUES (?)").await {
            Err(e) if matches!(e.content(), ConnectionErrorContent::TestCancelled) => (),
            Ok(statement) => {
                session.set_cancel_count(None);
                session.close_statement(statement).await?;
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    session.set_cancel_count(None);
    session.ping().await?;
    assert_eq!(session.state(), SessionState::Ready);
    Ok(())
}

#[tokio::test]
async fn prepared_statements() -> Result<(), Error> {
    for config in variants() {
        let server = MockServer::start(config).await?;
        let mut session = Session::connect(&server.options()).await?;

        let insert = session.prepare("INSERT INTO t VALUES (?, ?)").await?;
        assert_eq!(insert.param_count(), 2);
        assert!(insert.columns().is_empty());
        let e = session
            .execute_statement(&insert, &[1.into()])
            .await
            .unwrap_err();
        assert!(matches!(
            e.content(),
            ConnectionErrorContent::ParameterCount {
                expected: 2,
                got: 1
            }
        ));
        let ok = session
            .execute_statement(&insert, &[1.into(), "x".into()])
            .await?;
        assert_eq!(ok.affected_rows, 2);
        session.close_statement(insert).await?;

        let select = session.prepare("SELECT ?").await?;
        assert_eq!(select.columns().len(), 1);
        let values = session
            .fetch_statement(&select, &[Param::Int(-42)])
            .await?
            .map_rows(|row| Ok(row.get(0)?.as_i64()))
            .await?;
        assert_eq!(values, [Some(-42)]);
        let values = session
            .fetch_statement(&select, &[Param::Null])
            .await?
            .map_rows(|row| Ok(row.get(0)?.is_null()))
            .await?;
        assert_eq!(values, [true]);
        let values = session
            .fetch_statement(&select, &["hello".into()])
            .await?
            .map_rows(|row| Ok(row.get(0)?.as_str().map(str::to_string)))
            .await?;
        assert_eq!(values, [Some("hello".to_string())]);
    }
    Ok(())
}

#[tokio::test]
async fn transactions() -> Result<(), Error> {
    let server = server().await;
    let mut session = Session::connect(&server.options()).await?;
    let id = session.connection_id();

    let mut tr = session.begin().await?;
    tr.execute("INSERT 1").await?;
    let mut inner = tr.begin().await?;
    inner.execute("INSERT 2").await?;
    inner.commit().await?;
    tr.rollback().await?;

    {
        let mut tr = session.begin().await?;
        tr.execute("INSERT 3").await?;
        // Dropped without commit
    }
    assert!(session.in_transaction());
    session.ping().await?;
    assert!(!session.in_transaction());

    assert_eq!(
        server.log_for(id),
        [
            "QUERY BEGIN",
            "QUERY INSERT 1",
            "QUERY SAVEPOINT mywire_sp_1",
            "QUERY INSERT 2",
            "QUERY RELEASE SAVEPOINT mywire_sp_1",
            "QUERY ROLLBACK",
            "QUERY BEGIN",
            "QUERY INSERT 3",
            "QUERY ROLLBACK",
            "PING",
        ]
    );
    Ok(())
}

#[tokio::test]
async fn reset_uses_reset_connection() -> Result<(), Error> {
    let server = server().await;
    let mut session = Session::connect(&server.options().database("shop")).await?;
    assert_eq!(session.database(), Some("shop"));
    session.init_db("other").await?;
    session.reset().await?;
    assert_eq!(session.database(), Some("shop"));
    let id = session.connection_id();
    assert_eq!(
        server.log_for(id),
        ["INIT_DB other", "RESET_CONNECTION", "INIT_DB shop"]
    );

    // Old servers fall back to change user
    let server = MockServer::start(MockConfig {
        version: "5.5.5-10.1.48-MariaDB".to_string(),
        ..Default::default()
    })
    .await?;
    let mut session = Session::connect(&server.options()).await?;
    assert!(session.server_version().mariadb);
    session.reset().await?;
    assert_eq!(server.log_for(session.connection_id()), ["CHANGE_USER"]);
    Ok(())
}

#[tokio::test]
async fn cancel_after_completion_is_not_running() -> Result<(), Error> {
    let server = server().await;
    let mut session = Session::connect(&server.options()).await?;
    let handle = session.cancel_handle();
    let command = session
        .send_command(mywire::Command::Query("SELECT 1"))
        .await?;
    session.read_result_header().await?;
    while session.next_row().await?.is_some() {}

    assert_eq!(handle.cancel(command).await?, CancelOutcome::NotRunning);
    assert_eq!(handle.cancel(command).await?, CancelOutcome::NotRunning);
    // No auxiliary connection was opened
    assert_eq!(server.accepted(), 1);
    session.ping().await?;
    Ok(())
}

#[tokio::test]
async fn cancel_running_query() -> Result<(), Error> {
    let server = server().await;
    let mut session = Session::connect(&server.options()).await?;
    let handle = session.cancel_handle();

    let canceller = tokio::spawn(async move {
        loop {
            if let Some(command) = handle.current() {
                return handle.cancel(command).await;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
    let e = session
        .query("SELECT SLEEP(5000)")
        .await
        .map(|_| ())
        .unwrap_err();
    assert!(
        matches!(e.content(), ConnectionErrorContent::QueryInterrupted(_)),
        "{e:?}"
    );
    assert_eq!(canceller.await.unwrap()?, CancelOutcome::Cancelled);
    assert_eq!(session.state(), SessionState::Ready);

    let mut rows = session.query("SELECT 1").await?;
    assert!(rows.next().await?.is_some());
    let log = server.log_for(session.connection_id());
    assert!(!log.iter().any(|v| v == "QUERY DO SLEEP(0)"), "{log:?}");
    Ok(())
}

#[tokio::test]
async fn late_kill_is_absorbed() -> Result<(), Error> {
    let server = server().await;
    let mut session = Session::connect(&server.options()).await?;
    let handle = session.cancel_handle();

    let command = session
        .send_command(mywire::Command::Query("SELECT ROWS 2"))
        .await?;
    session.read_result_header().await?;
    assert_eq!(session.state(), SessionState::Streaming);
    // The rows are already sent, so the kill lands after the command completes
    assert_eq!(handle.cancel(command).await?, CancelOutcome::Cancelled);
    assert_eq!(session.state(), SessionState::Canceling);
    while session.next_row().await?.is_some() {}

    let mut rows = session.query("SELECT 1").await?;
    assert!(rows.next().await?.is_some());
    assert_eq!(
        server.log_for(session.connection_id()),
        ["QUERY SELECT ROWS 2", "QUERY DO SLEEP(0)", "QUERY SELECT 1"]
    );
    Ok(())
}

#[tokio::test]
async fn pool_exhaustion_timeout() -> Result<(), Error> {
    let server = server().await;
    let pool = Pool::connect(
        server.options(),
        PoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_millis(100)),
    )
    .await?;
    let held = pool.acquire().await?;
    let e = pool.acquire().await.map(|_| ()).unwrap_err();
    assert!(matches!(e.content(), ConnectionErrorContent::PoolTimeout(_)));
    assert_eq!(pool.stats().leased, 1);
    assert_eq!(pool.stats().waiting, 0);

    let id = held.connection_id();
    held.release().await;
    let mut again = pool.acquire().await?;
    assert_eq!(again.connection_id(), id);
    again.ping().await?;
    Ok(())
}

#[tokio::test]
async fn pool_waiter_gets_returned_session() -> Result<(), Error> {
    let server = server().await;
    let pool = Pool::connect(server.options(), PoolOptions::new().max_connections(1)).await?;
    let held = pool.acquire().await?;
    let id = held.connection_id();
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|c| c.connection_id()) }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.stats().waiting, 1);
    // Dropping without release hands the session over as well
    drop(held);
    assert_eq!(waiter.await.unwrap()?, id);
    Ok(())
}

#[tokio::test]
async fn pool_max_under_concurrency() -> Result<(), Error> {
    let server = server().await;
    let pool = Pool::new(server.options(), PoolOptions::new().max_connections(3))?;
    let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for _ in 0..20 {
        let pool = pool.clone();
        let active = active.clone();
        tasks.push(tokio::spawn(async move {
            let mut conn = pool.acquire().await?;
            let now = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            assert!(now <= 3);
            let r = conn.query("SELECT SLEEP(10)").await.map(|_| ());
            active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            conn.release().await;
            r
        }));
    }
    for task in tasks {
        task.await.unwrap()?;
    }
    assert!(server.peak() <= 3, "peak {}", server.peak());
    let stats = pool.stats();
    assert_eq!(stats.leased, 0);
    assert!(stats.idle <= 3);
    Ok(())
}

#[tokio::test]
async fn clear_invalidates_sessions() -> Result<(), Error> {
    let server = server().await;
    let pool = Pool::connect(server.options(), PoolOptions::new().max_connections(2)).await?;
    let first = pool.acquire().await?;
    let first_id = first.connection_id();
    first.release().await;

    let leased = pool.acquire().await?;
    assert_eq!(leased.connection_id(), first_id);
    pool.clear();
    assert_eq!(pool.stats().generation, 1);

    // The leased session is closed when returned
    leased.release().await;
    assert_eq!(pool.stats().idle, 0);

    let fresh = pool.acquire().await?;
    assert_ne!(fresh.connection_id(), first_id);
    fresh.release().await;
    assert_eq!(pool.stats().idle, 1);

    pool.close().await;
    let e = pool.acquire().await.map(|_| ()).unwrap_err();
    assert!(matches!(e.content(), ConnectionErrorContent::PoolClosed));
    Ok(())
}

#[tokio::test]
async fn pool_reclaims_dropped_busy_session() -> Result<(), Error> {
    let server = server().await;
    let pool = Pool::connect(server.options(), PoolOptions::new().max_connections(1)).await?;
    let mut conn = pool.acquire().await?;
    let id = conn.connection_id();
    {
        let mut rows = conn.query("SELECT ROWS 5").await?;
        rows.next().await?;
    }
    drop(conn);

    let mut conn = pool.acquire().await?;
    assert_eq!(conn.connection_id(), id);
    assert_eq!(conn.state(), SessionState::Ready);
    let mut rows = conn.query("SELECT 1").await?;
    assert!(rows.next().await?.is_some());
    Ok(())
}

#[tokio::test]
async fn execute_with_query_attributes() -> Result<(), Error> {
    let server = MockServer::start(MockConfig {
        query_attributes: true,
        ..Default::default()
    })
    .await?;
    let mut session = Session::connect(&server.options()).await?;
    assert!(session.capabilities().query_attributes());

    // The server rejects the execute unless the parameter count precedes the null bitmap
    let insert = session.prepare("INSERT INTO t VALUES (?)").await?;
    let ok = session.execute_statement(&insert, &[Param::Int(7)]).await?;
    assert_eq!(ok.affected_rows, 1);

    let select = session.prepare("SELECT ?").await?;
    let values = session
        .fetch_statement(&select, &[Param::Int(7)])
        .await?
        .map_rows(|row| Ok(row.get(0)?.as_i64()))
        .await?;
    assert_eq!(values, [Some(7)]);

    // Text queries carry an empty attribute list
    let mut rows = session.query("SELECT 1").await?;
    assert!(rows.next().await?.is_some());
    Ok(())
}

#[tokio::test]
async fn pool_cancel_when_exhausted() -> Result<(), Error> {
    let server = server().await;
    let pool = Pool::connect(
        server.options(),
        PoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10)),
    )
    .await?;
    let mut conn = pool.acquire().await?;
    let handle = conn.cancel_handle();

    let start = std::time::Instant::now();
    let canceller = tokio::spawn({
        let pool = pool.clone();
        async move {
            loop {
                if let Some(command) = handle.current() {
                    return pool.cancel(&handle, command).await;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    });
    let e = conn
        .query("SELECT SLEEP(5000)")
        .await
        .map(|_| ())
        .unwrap_err();
    assert!(
        matches!(e.content(), ConnectionErrorContent::QueryInterrupted(_)),
        "{e:?}"
    );
    assert_eq!(canceller.await.unwrap()?, CancelOutcome::Cancelled);
    assert!(start.elapsed() < Duration::from_secs(4));

    // The kill went over a session outside the pool
    assert_eq!(server.accepted(), 2);
    assert_eq!(pool.stats().leased, 1);
    conn.ping().await?;
    conn.release().await;
    assert_eq!(pool.stats().idle, 1);
    Ok(())
}

#[tokio::test]
async fn pool_cancel_uses_free_slot() -> Result<(), Error> {
    let server = server().await;
    let pool = Pool::connect(server.options(), PoolOptions::new().max_connections(2)).await?;
    let mut conn = pool.acquire().await?;
    let handle = conn.cancel_handle();
    let canceller = tokio::spawn({
        let pool = pool.clone();
        async move {
            loop {
                if let Some(command) = handle.current() {
                    return pool.cancel(&handle, command).await;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    });
    let e = conn
        .query("SELECT SLEEP(5000)")
        .await
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(
        e.content(),
        ConnectionErrorContent::QueryInterrupted(_)
    ));
    assert_eq!(canceller.await.unwrap()?, CancelOutcome::Cancelled);
    conn.release().await;
    // The kill was sent on a second pooled session, which went back to the pool
    assert_eq!(server.accepted(), 2);
    assert_eq!(pool.stats().idle, 2);
    Ok(())
}

#[tokio::test]
async fn procedure_lookup_loads_once() -> Result<(), Error> {
    let server = server().await;
    let pool = Pool::connect(server.options(), PoolOptions::new().max_connections(2)).await?;
    let mut a = pool.acquire().await?;
    let mut b = pool.acquire().await?;

    let (pa, pb) = tokio::join!(
        a.procedure("shop", "add_item"),
        b.procedure("shop", "add_item")
    );
    let (pa, pb) = (pa?.expect("routine"), pb?.expect("routine"));
    assert!(Arc::ptr_eq(&pa, &pb));
    assert_eq!(pa.kind, RoutineKind::Procedure);
    assert_eq!(
        pa.parameters
            .iter()
            .map(|p| (p.ordinal, p.mode, p.name.as_str(), p.data_type.as_str()))
            .collect::<Vec<_>>(),
        [
            (1, ParameterMode::In, "item", "int"),
            (2, ParameterMode::Out, "total", "decimal")
        ]
    );

    // Lookups ignore case and are served from the cache
    assert!(a.procedure("SHOP", "Add_Item").await?.is_some());
    let routine_queries = |server: &MockServer| {
        server
            .log()
            .iter()
            .filter(|v| v.contains("`ROUTINES`"))
            .count()
    };
    assert_eq!(routine_queries(&server), 1);

    assert!(b.procedure("shop", "missing").await?.is_none());
    assert_eq!(routine_queries(&server), 2);
    assert_eq!(pool.procedures().len(), 2);

    pool.procedures().invalidate("shop", "add_item");
    assert!(a.procedure("shop", "add_item").await?.is_some());
    assert_eq!(routine_queries(&server), 3);
    Ok(())
}

#[tokio::test]
async fn unreachable_host_lists_addresses() -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    let options = mywire::ConnectionOptions::new()
        .host("127.0.0.1")
        .port(port)
        .user("mock")
        .connect_timeout(Duration::from_millis(300));
    let e = Session::connect(&options).await.map(|_| ()).unwrap_err();
    match e.content() {
        ConnectionErrorContent::UnableToConnect { attempted, .. } => {
            assert_eq!(attempted, &format!("127.0.0.1:{port}"))
        }
        v => panic!("Unexpected error {v:?}"),
    }

    // A documentation address either fails or times out while connecting
    let options = mywire::ConnectionOptions::new()
        .host("192.0.2.1")
        .user("mock")
        .connect_timeout(Duration::from_millis(300));
    let e = Session::connect(&options).await.map(|_| ()).unwrap_err();
    match e.content() {
        ConnectionErrorContent::UnableToConnect { attempted, .. } => {
            assert!(attempted.contains("192.0.2.1"), "{attempted}")
        }
        v => panic!("Unexpected error {v:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn silent_server_times_out() -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let _accept = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    let options = mywire::ConnectionOptions::new()
        .host("127.0.0.1")
        .port(port)
        .user("mock")
        .connect_timeout(Duration::from_millis(200));
    let e = Session::connect(&options).await.map(|_| ()).unwrap_err();
    assert!(
        matches!(e.content(), ConnectionErrorContent::Timeout("opening session")),
        "{e:?}"
    );
    Ok(())
}

#[test]
fn blocking_session() -> Result<(), Error> {
    let runtime = tokio::runtime::Runtime::new()?;
    let server = runtime.block_on(MockServer::start(MockConfig::default()))?;
    let timeout = Duration::from_secs(5);

    let mut session = BlockingSession::connect(&server.options(), timeout)?;
    let values = session.query_map("SELECT ROWS 3", |row| Ok(row.get(0)?.as_i64()))?;
    assert_eq!(values, [Some(0), Some(1), Some(2)]);
    assert_eq!(session.execute("DO 1")?.affected_rows, 1);

    let statement = session.prepare("SELECT ?")?;
    let values = session.fetch_statement_map(&statement, &["abc".into()], |row| {
        Ok(row.get(0)?.as_str().map(str::to_string))
    })?;
    assert_eq!(values, [Some("abc".to_string())]);
    session.close_statement(statement)?;

    assert_eq!(
        session.cancel_handle().cancel_current()?,
        CancelOutcome::NotRunning
    );
    let e = session.execute("FAIL").unwrap_err();
    assert_eq!(e.server_code(), Some(1064));
    session.ping()?;
    session.reset()?;
    let id = session.session().connection_id();
    session.close();

    std::thread::sleep(Duration::from_millis(20));
    let log = server.log_for(id);
    assert_eq!(log.first().map(String::as_str), Some("QUERY SELECT ROWS 3"));
    assert_eq!(log.last().map(String::as_str), Some("QUIT"));
    drop(server);
    Ok(())
}

#[test]
fn blocking_pool() -> Result<(), Error> {
    let runtime = tokio::runtime::Runtime::new()?;
    let server = runtime.block_on(MockServer::start(MockConfig::default()))?;

    let pool = BlockingPool::connect(
        server.options(),
        PoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_millis(100)),
        Duration::from_secs(5),
    )?;
    let mut conn = pool.acquire()?;
    let id = conn.session().connection_id();
    let values = conn.query_map("SELECT 1", |row| Ok(row.get(0)?.as_i64()))?;
    assert_eq!(values, [Some(1)]);

    let e = pool.acquire().map(|_| ()).unwrap_err();
    assert!(matches!(e.content(), ConnectionErrorContent::PoolTimeout(_)));
    assert_eq!(pool.stats().leased, 1);

    conn.release();
    let mut conn = pool.acquire()?;
    assert_eq!(conn.session().connection_id(), id);
    conn.ping()?;
    conn.release();
    assert_eq!(pool.stats().idle, 1);
    pool.close();
    drop(server);
    Ok(())
}
