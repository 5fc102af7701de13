use std::net::{SocketAddr, TcpListener};
use std::thread;

use kvstream::flow::Source;
use kvstream::{
    BatchOp, Credentials, KvIterator, KvStore, KvsClient, KvsEngine, KvsError, KvsServer,
    RangeOptions, RayonThreadPool, Record, ServerConfig, SharedQueueThreadPool, SledKvsEngine,
    ThreadPool,
};
use serde_json::json;
use tempfile::TempDir;

fn credentials() -> Credentials {
    Credentials::new("server-test", "server")
}

/// starts a server on an ephemeral port; it lives until the test process exits
fn start<E: KvsEngine, P: ThreadPool + Send + 'static>(engine: E, pool: P) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        addr,
        credentials: Some(credentials()),
        meta: json!({ "some": "meta" }),
        ..ServerConfig::default()
    };
    let server = KvsServer::new(engine, pool, config);
    thread::spawn(move || server.serve_on(listener));
    addr
}

fn kvs_server() -> (TempDir, SocketAddr) {
    let dir = TempDir::new().unwrap();
    let engine = KvStore::open(dir.path()).unwrap();
    let addr = start(engine, SharedQueueThreadPool::new(4).unwrap());
    (dir, addr)
}

fn seed(client: &mut KvsClient, n: usize) {
    let ops = (0..n)
        .map(|i| BatchOp::Put {
            key: format!("key{:03}", i),
            value: format!("value{}", i),
        })
        .collect();
    client.batch(ops).unwrap();
}

#[test]
fn get_put_delete_round_trip() {
    let (_dir, addr) = kvs_server();
    let mut client = KvsClient::connect(addr, Some(credentials())).unwrap();

    assert_eq!(client.get("foo").unwrap(), None);
    client.put("foo", "bar").unwrap();
    assert_eq!(client.get("foo").unwrap(), Some("bar".to_owned()));
    client.delete("foo").unwrap();
    assert_eq!(client.get("foo").unwrap(), None);
    assert!(matches!(client.delete("foo"), Err(KvsError::KeyNotFound)));
}

#[test]
fn json_values_and_meta() {
    let (_dir, addr) = kvs_server();
    let mut client = KvsClient::connect(addr, Some(credentials())).unwrap();

    client.put_json("doc", &json!({ "n": 1, "tags": ["a"] })).unwrap();
    let doc: serde_json::Value = client.get_json("doc").unwrap().unwrap();
    assert_eq!(doc["tags"][0], "a");

    assert_eq!(client.meta().unwrap()["some"], "meta");
    assert!(client.approximate_size("a", "z").unwrap() > 0);
}

#[test]
fn requests_need_a_login() {
    let (_dir, addr) = kvs_server();
    assert!(matches!(
        KvsClient::connect(addr, Some(Credentials::new("server-test", "wrong"))),
        Err(KvsError::Unauthorized)
    ));

    let mut anonymous = KvsClient::connect(addr, None).unwrap();
    assert!(matches!(anonymous.get("foo"), Err(KvsError::Unauthorized)));
    assert!(matches!(anonymous.meta(), Err(KvsError::Unauthorized)));

    let mut client = KvsClient::connect(addr, Some(credentials())).unwrap();
    client.put("foo", "bar").unwrap();
    client.logout().unwrap();
    assert!(matches!(client.get("foo"), Err(KvsError::Unauthorized)));
}

#[test]
fn remote_iterator_walks_a_range_with_projection() {
    let (_dir, addr) = kvs_server();
    let mut client = KvsClient::connect(addr, Some(credentials())).unwrap();
    seed(&mut client, 50);

    let opts = RangeOptions {
        start: Some("key010".to_owned()),
        lt: Some("key040".to_owned()),
        values: false,
        ..RangeOptions::default()
    };
    let keys: Vec<_> = client
        .iterator(opts)
        .unwrap()
        .entries()
        .map(|e| e.unwrap())
        .map(|e| {
            assert!(e.value.is_none());
            e.key.unwrap()
        })
        .collect();
    assert_eq!(keys.len(), 30);
    assert_eq!(keys.first().map(String::as_str), Some("key010"));
    assert_eq!(keys.last().map(String::as_str), Some("key039"));
}

#[test]
fn remote_iterator_can_be_ended_early() {
    let (_dir, addr) = kvs_server();
    let mut client = KvsClient::connect(addr, Some(credentials())).unwrap();
    seed(&mut client, 100);

    let mut it = client.iterator(RangeOptions::all()).unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    let first = tx.clone();
    it.next(Box::new(move |r| first.send(r.map(|e| e.and_then(|e| e.key))).unwrap()));
    assert_eq!(rx.recv().unwrap().unwrap(), Some("key000".to_owned()));

    it.end(Box::new(|r| assert!(r.is_ok())));
    it.next(Box::new(move |r| tx.send(r.map(|e| e.and_then(|e| e.key))).unwrap()));
    assert!(matches!(rx.recv().unwrap(), Err(KvsError::IteratorClosed)));

    // the connection used by the plain requests is unaffected
    assert_eq!(client.get("key099").unwrap(), Some("value99".to_owned()));
}

#[test]
fn read_stream_reverse_with_limit() {
    let (_dir, addr) = kvs_server();
    let mut client = KvsClient::connect(addr, Some(credentials())).unwrap();
    seed(&mut client, 20);

    let opts = RangeOptions {
        reverse: true,
        limit: Some(3),
        ..RangeOptions::default()
    };
    let records: Vec<Record> = client
        .read_stream(opts)
        .unwrap()
        .drain()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(
        records,
        vec![
            Record::new("key019", "value19"),
            Record::new("key018", "value18"),
            Record::new("key017", "value17"),
        ]
    );
}

#[test]
fn key_and_value_streams_carry_one_side() {
    let (_dir, addr) = kvs_server();
    let mut client = KvsClient::connect(addr, Some(credentials())).unwrap();
    seed(&mut client, 5);

    let range = |keys, values| RangeOptions {
        gte: Some("key001".to_owned()),
        lte: Some("key003".to_owned()),
        keys,
        values,
        ..RangeOptions::default()
    };
    let keys: Vec<String> = client
        .key_stream(range(true, false))
        .unwrap()
        .drain()
        .map(|k| k.unwrap())
        .collect();
    assert_eq!(keys, vec!["key001", "key002", "key003"]);

    let values: Vec<String> = client
        .value_stream(range(false, true))
        .unwrap()
        .drain()
        .map(|v| v.unwrap())
        .collect();
    assert_eq!(values, vec!["value1", "value2", "value3"]);
}

#[test]
fn write_stream_stores_every_record() {
    let (_dir, addr) = kvs_server();
    let client = KvsClient::connect(addr, Some(credentials())).unwrap();

    let mut writer = client.write_stream().unwrap();
    for i in 0..25 {
        writer.write(Record::new(format!("w{:02}", i), i.to_string())).unwrap();
    }
    assert_eq!(writer.finish().unwrap(), 25);

    let keys: Vec<_> = client
        .read_stream(RangeOptions::between("w00", "w99"))
        .unwrap()
        .drain()
        .map(|r| r.unwrap().key)
        .collect();
    assert_eq!(keys.len(), 25);
}

#[test]
fn sled_engine_behind_a_rayon_pool() {
    let dir = TempDir::new().unwrap();
    let engine = SledKvsEngine::new(sled::open(dir.path()).unwrap());
    let addr = start(engine, RayonThreadPool::new(2).unwrap());

    let mut client = KvsClient::connect(addr, Some(credentials())).unwrap();
    seed(&mut client, 10);
    client
        .batch(vec![BatchOp::Del {
            key: "key000".to_owned(),
        }])
        .unwrap();

    let keys: Vec<_> = client
        .iterator(RangeOptions::between("key000", "key004"))
        .unwrap()
        .entries()
        .map(|e| e.unwrap().key.unwrap())
        .collect();
    assert_eq!(keys, vec!["key001", "key002", "key003", "key004"]);
}
