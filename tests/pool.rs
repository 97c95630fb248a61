mod common;

use ntlmpool::{Error, Headers, NtlmConnectionPool, PoolConfig, RequestOptions};

use crate::common::{IDENTIFIER, PASSWORD, ScriptedTransport, init_tracing, test_config};


fn pool(transport: ScriptedTransport) -> NtlmConnectionPool<ScriptedTransport> {
    NtlmConnectionPool::with_transport(transport, test_config(), IDENTIFIER, PASSWORD).unwrap()
}

fn options(retries: u32) -> RequestOptions {
    RequestOptions {
        retries,
        ..RequestOptions::default()
    }
}


#[tokio::test]
async fn keep_alive_replaces_connection_close_on_every_request() {
    init_tracing();
    let pool = pool(ScriptedTransport::ntlm_server());

    for _ in 0..3 {
        let headers: Headers = [("Connection", "close")].into_iter().collect();
        let response = pool.urlopen("GET", "/data", None, Some(headers), RequestOptions::default()).await.unwrap();
        assert_eq!(response.body, b"GET /data Keep-Alive");
    }

    let response = pool.urlopen("GET", "/data", None, None, RequestOptions::default()).await.unwrap();
    assert_eq!(response.body, b"GET /data Keep-Alive");
    assert_eq!(pool.num_connections(), 1);
}

#[tokio::test]
async fn header_injection_is_refused_before_connecting() {
    let transport = ScriptedTransport::ntlm_server();
    let stats = transport.stats();
    let pool = pool(transport);

    let smuggled: Headers = [("X-Note", "a\r\nConnection: smuggled")].into_iter().collect();
    match pool.urlopen("GET", "/data", None, Some(smuggled), options(3)).await {
        Err(Error::InvalidRequest(reason)) => assert!(reason.contains("X-Note")),
        other => panic!("unexpected result: {:?}", other),
    }

    let bad_name: Headers = [("X Note", "fine")].into_iter().collect();
    assert!(matches!(
        pool.urlopen("GET", "/data", None, Some(bad_name), RequestOptions::default()).await,
        Err(Error::InvalidRequest(_)),
    ));
    assert!(matches!(
        pool.urlopen("GE T", "/data", None, None, RequestOptions::default()).await,
        Err(Error::InvalidRequest(_)),
    ));
    assert_eq!(pool.num_connections(), 0);
    assert_eq!(stats.connects(), 0);

    let response = pool.get("/data").await.unwrap();
    assert_eq!(response.body, b"GET /data Keep-Alive");
    assert_eq!(pool.pool().factory().auth_path(), "/auth");
}

#[tokio::test]
async fn authenticated_connection_is_reused() {
    let transport = ScriptedTransport::ntlm_server();
    let stats = transport.stats();
    let pool = pool(transport);

    let first = pool.get("/one").await.unwrap();
    let second = pool.get("http://intranet/two?page=2").await.unwrap();
    let third = pool.urlopen("POST", "/three", Some(b"payload".to_vec()), None, RequestOptions::default()).await.unwrap();

    assert_eq!(first.body, b"GET /one Keep-Alive");
    assert_eq!(second.body, b"GET /two?page=2 Keep-Alive");
    assert_eq!(third.body, b"POST /three Keep-Alive payload");
    assert_eq!(stats.connects(), 1);
    assert_eq!(stats.requests(), 2 + 3);
    assert_eq!(pool.pool().num_requests(), 3);
}

#[tokio::test]
async fn closed_connection_is_replaced() {
    let transport = ScriptedTransport::ntlm_server();
    let stats = transport.stats();
    let pool = pool(transport);

    assert_eq!(pool.get("/close").await.unwrap().body, b"bye");
    assert_eq!(pool.pool().idle_connections(), 0);
    assert_eq!(pool.get("/data").await.unwrap().status, 200);
    assert_eq!(stats.connects(), 2);
    assert_eq!(pool.num_connections(), 2);
}

#[tokio::test]
async fn transport_failures_are_retried() {
    let transport = ScriptedTransport::ntlm_server().refusing_first(2);
    let stats = transport.stats();
    let pool = pool(transport);

    let response = pool.get("/data").await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(stats.connects(), 3);
}

#[tokio::test]
async fn exhausted_retries_report_the_last_error() {
    let transport = ScriptedTransport::ntlm_server().refusing_first(100);
    let stats = transport.stats();
    let pool = pool(transport);

    match pool.urlopen("GET", "/data", None, None, options(2)).await {
        Err(Error::MaxRetries { url, source }) => {
            assert_eq!(url, "http://intranet/data");
            assert_eq!(source.kind(), std::io::ErrorKind::ConnectionRefused);
        },
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(stats.connects(), 3);
}

#[tokio::test]
async fn rejected_credentials_are_not_retried() {
    let transport = ScriptedTransport::ntlm_server();
    let stats = transport.stats();
    let pool = NtlmConnectionPool::with_transport(transport, test_config(), IDENTIFIER, "wrong").unwrap();

    assert!(matches!(pool.get("/data").await, Err(Error::AuthenticationRejected { .. })));
    assert_eq!(stats.connects(), 1);
}

#[tokio::test]
async fn redirects_are_followed() {
    let pool = pool(ScriptedTransport::ntlm_server());

    let response = pool.get("/redirect").await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"GET /data Keep-Alive");
    assert_eq!(pool.pool().num_requests(), 2);

    let response = pool.urlopen("POST", "/see-other", Some(b"form".to_vec()), None, RequestOptions::default()).await.unwrap();
    assert_eq!(response.body, b"GET /data Keep-Alive");
}

#[tokio::test]
async fn redirects_can_be_disabled() {
    let pool = pool(ScriptedTransport::ntlm_server());
    let options = RequestOptions {
        redirect: false,
        ..RequestOptions::default()
    };

    let response = pool.urlopen("GET", "/redirect", None, None, options).await.unwrap();
    assert_eq!(response.status, 302);
    assert_eq!(response.redirect_location(), Some("/data"));
}

#[tokio::test]
async fn redirect_loops_use_up_retries() {
    let pool = pool(ScriptedTransport::ntlm_server());

    match pool.urlopen("GET", "/loop", None, None, options(3)).await {
        Err(Error::TooManyRedirects { url }) => assert_eq!(url, "http://intranet/loop"),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(pool.pool().num_requests(), 4);
}

#[tokio::test]
async fn foreign_hosts_are_rejected() {
    let pool = pool(ScriptedTransport::ntlm_server());

    assert!(matches!(
        pool.get("https://elsewhere.example/data").await,
        Err(Error::HostMismatch { .. }),
    ));
    assert_eq!(pool.num_connections(), 0);

    match pool.get("/external").await {
        Err(Error::HostMismatch { url, expected }) => {
            assert_eq!(url, "https://elsewhere.example/");
            assert_eq!(expected, "http://intranet/");
        },
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn foreign_hosts_pass_without_host_assertion() {
    let pool = pool(ScriptedTransport::ntlm_server());
    let options = RequestOptions {
        assert_same_host: false,
        ..RequestOptions::default()
    };

    let response = pool.urlopen("GET", "http://proxy.example/data", None, None, options).await.unwrap();
    assert_eq!(response.body, b"GET http://proxy.example/data Keep-Alive");
}

#[test]
fn construction_validates_input() {
    assert!(matches!(
        NtlmConnectionPool::with_transport(ScriptedTransport::ntlm_server(), test_config(), "alice", PASSWORD),
        Err(Error::MalformedCredential { .. }),
    ));
    assert!(matches!(
        NtlmConnectionPool::with_transport(ScriptedTransport::ntlm_server(), PoolConfig::default(), IDENTIFIER, PASSWORD),
        Err(Error::InvalidConfig(_)),
    ));

    let pool = pool(ScriptedTransport::ntlm_server());
    assert_eq!(pool.credentials().domain(), "CONTOSO");
    assert_eq!(pool.credentials().username(), "alice");
    assert_eq!(pool.pool().origin().as_str(), "http://intranet/");
}
