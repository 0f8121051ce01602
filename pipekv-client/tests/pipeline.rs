use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pipekv_client::{ClientConfig, ClientError, ClientResult, Command, KVClient, Reply, RespValue};

type Args = Vec<Vec<u8>>;

/// Scripted server: the closure owns the listener and drives every connection.
fn spawn_server<F>(script: F) -> (String, JoinHandle<()>)
where
    F: FnOnce(TcpListener) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let handle = thread::spawn(move || script(listener));
    (addr, handle)
}

fn accept(listener: &TcpListener) -> (BufReader<TcpStream>, TcpStream) {
    let (stream, _) = listener.accept().expect("accept");
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let reader = BufReader::new(stream.try_clone().expect("clone"));
    (reader, stream)
}

/// Returns true when a client dialed the listener after the scripted part ended.
fn has_pending_connection(listener: &TcpListener) -> bool {
    listener.set_nonblocking(true).expect("nonblocking");
    match listener.accept() {
        Ok(_) => true,
        Err(err) if err.kind() == ErrorKind::WouldBlock => false,
        Err(err) => panic!("accept failed: {err}"),
    }
}

fn read_commands(reader: &mut BufReader<TcpStream>, count: usize) -> Vec<Args> {
    (0..count)
        .map(|_| read_command(reader).expect("read command"))
        .collect()
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Args> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data)?;
        if data[len..] != *b"\r\n" {
            return Err(std::io::Error::new(ErrorKind::InvalidData, "missing crlf"));
        }
        data.truncate(len);
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<()> {
    buf.clear();
    reader.read_until(b'\n', buf)?;
    if buf.len() < 2 || !buf.ends_with(b"\r\n") {
        return Err(std::io::Error::new(ErrorKind::UnexpectedEof, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidData, "digit"))
}

fn args(words: &[&str]) -> Args {
    words.iter().map(|word| word.as_bytes().to_vec()).collect()
}

fn reply(stream: &mut TcpStream, raw: &[u8]) {
    stream.write_all(raw).expect("write reply");
    stream.flush().expect("flush");
}

fn client_with(addr: String, max_total: usize, read_timeout: Duration) -> KVClient {
    KVClient::with_config(ClientConfig {
        addr,
        max_idle: 1,
        max_total,
        read_timeout: Some(read_timeout),
        write_timeout: Some(Duration::from_secs(1)),
        connect_timeout: Some(Duration::from_secs(1)),
    })
}

fn client_for(addr: String) -> KVClient {
    client_with(addr, 1, Duration::from_secs(2))
}

fn values(replies: Vec<Reply>) -> Vec<RespValue> {
    replies.into_iter().map(|reply| reply.expect("reply")).collect()
}

fn bulk(data: &[u8]) -> RespValue {
    RespValue::Bulk(Some(data.to_vec()))
}

#[test]
fn set_incr_get_replies_arrive_in_order() {
    let (addr, server) = spawn_server(|listener| {
        let (mut reader, mut stream) = accept(&listener);
        let commands = read_commands(&mut reader, 3);
        assert_eq!(
            commands,
            vec![args(&["SET", "k", "1"]), args(&["INCR", "k"]), args(&["GET", "k"])]
        );
        reply(&mut stream, b"+OK\r\n:2\r\n$1\r\n2\r\n");
    });

    let client = client_for(addr);
    let mut pipeline = client.pipeline();
    pipeline.set(b"k", b"1").incr(b"k").get(b"k");
    let replies = values(pipeline.execute().expect("execute"));

    assert_eq!(
        replies,
        vec![RespValue::Simple(b"OK".to_vec()), RespValue::Integer(2), bulk(b"2")]
    );
    assert!(pipeline.is_empty());
    server.join().expect("server");
}

#[test]
fn hgetall_decodes_flat_field_value_array() {
    let (addr, server) = spawn_server(|listener| {
        let (mut reader, mut stream) = accept(&listener);
        let commands = read_commands(&mut reader, 2);
        assert_eq!(commands[0], args(&["HSET", "h", "f", "v"]));
        assert_eq!(commands[1], args(&["HGETALL", "h"]));
        reply(&mut stream, b":1\r\n*2\r\n$1\r\nf\r\n$1\r\nv\r\n");
    });

    let client = client_for(addr);
    let mut pipeline = client.pipeline();
    pipeline.hset(b"h", b"f", b"v").hgetall(b"h");
    let mut replies = values(pipeline.execute().expect("execute"));

    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0], RespValue::Integer(1));
    let all = replies.pop().expect("hgetall");
    assert_eq!(all, RespValue::Array(Some(vec![bulk(b"f"), bulk(b"v")])));
    assert_eq!(all.into_pairs(), Some(vec![(b"f".to_vec(), b"v".to_vec())]));
    server.join().expect("server");
}

#[test]
fn missing_and_empty_values_are_distinct() {
    let (addr, server) = spawn_server(|listener| {
        let (mut reader, mut stream) = accept(&listener);
        read_commands(&mut reader, 2);
        reply(&mut stream, b"$-1\r\n$0\r\n\r\n");
    });

    let client = client_for(addr);
    let mut pipeline = client.pipeline();
    pipeline.get(b"missing").get(b"empty");
    let replies = values(pipeline.execute().expect("execute"));

    assert_eq!(replies, vec![RespValue::Bulk(None), bulk(b"")]);
    server.join().expect("server");
}

#[test]
fn binary_values_are_sent_verbatim() {
    let (addr, server) = spawn_server(|listener| {
        let (mut reader, mut stream) = accept(&listener);
        let commands = read_commands(&mut reader, 1);
        assert_eq!(commands[0][2], b"a\r\n\x00\xff".to_vec());
        reply(&mut stream, b"+OK\r\n");
    });

    let client = client_for(addr);
    let mut pipeline = client.pipeline();
    pipeline.set(b"bin", b"a\r\n\x00\xff");
    let replies = values(pipeline.execute().expect("execute"));

    assert_eq!(replies, vec![RespValue::Simple(b"OK".to_vec())]);
    server.join().expect("server");
}

#[test]
fn error_reply_stays_in_its_slot() {
    let (addr, server) = spawn_server(|listener| {
        let (mut reader, mut stream) = accept(&listener);
        read_commands(&mut reader, 3);
        reply(
            &mut stream,
            b"+OK\r\n-WRONGTYPE Operation against a key holding the wrong kind of value\r\n$1\r\n1\r\n",
        );
    });

    let client = client_for(addr);
    let mut pipeline = client.pipeline();
    pipeline.set(b"s", b"1").lpush(b"s", b"x").get(b"s");
    let replies = values(pipeline.execute().expect("execute"));

    assert_eq!(replies.len(), 3);
    assert!(replies[1].is_error());
    assert_eq!(replies[2], bulk(b"1"));
    // A server error is a normal reply; the connection is still healthy.
    assert_eq!(client.pool().idle_count(), 1);
    server.join().expect("server");
}

#[test]
fn malformed_reply_is_slot_local_and_evicts_connection() {
    let (addr, server) = spawn_server(|listener| {
        let (mut reader, mut stream) = accept(&listener);
        read_commands(&mut reader, 3);
        reply(&mut stream, b"+OK\r\n?bogus\r\n:5\r\n");
    });

    let client = client_for(addr);
    let mut pipeline = client.pipeline();
    pipeline.ping().ping().incr(b"n");
    let replies = pipeline.execute().expect("execute");

    assert_eq!(replies.len(), 3);
    assert_eq!(*replies[0].as_ref().expect("ok"), RespValue::Simple(b"OK".to_vec()));
    assert!(matches!(replies[1], Err(ClientError::Protocol(_))));
    assert_eq!(*replies[2].as_ref().expect("int"), RespValue::Integer(5));
    assert_eq!(client.pool().idle_count(), 0);
    assert_eq!(client.pool().total_count(), 0);
    server.join().expect("server");
}

/// Sends `raw` in answer to two pipelined GETs and returns what `execute` gave back.
fn execute_two_gets_against(raw: &'static [u8]) -> (KVClient, ClientResult<Vec<Reply>>) {
    let (addr, server) = spawn_server(move |listener| {
        let (mut reader, mut stream) = accept(&listener);
        read_commands(&mut reader, 2);
        reply(&mut stream, raw);
    });

    let client = client_for(addr);
    let mut pipeline = client.pipeline();
    pipeline.get(b"a").get(b"b");
    let result = pipeline.execute();
    server.join().expect("server");
    (client, result)
}

fn assert_desync_aborts(raw: &'static [u8]) {
    let (client, result) = execute_two_gets_against(raw);
    match result {
        Err(ClientError::Desync(_)) => {}
        other => panic!("expected a desync failure, got {other:?}"),
    }
    assert_eq!(client.pool().idle_count(), 0);
    assert_eq!(client.pool().total_count(), 0);
}

#[test]
fn bad_element_inside_array_aborts_the_batch() {
    // Without aborting, the leftover `:5` would be handed to the second GET.
    assert_desync_aborts(b"*2\r\n?x\r\n:5\r\n:7\r\n");
}

#[test]
fn oversized_bulk_length_aborts_the_batch() {
    assert_desync_aborts(b"$600000000\r\n:9\r\n:7\r\n");
}

#[test]
fn non_numeric_bulk_length_aborts_the_batch() {
    assert_desync_aborts(b"$abc\r\nxyz\r\n:7\r\n");
}

#[test]
fn bulk_with_wrong_declared_length_aborts_the_batch() {
    assert_desync_aborts(b"$2\r\nhello\r\n:7\r\n");
}

#[test]
fn single_line_garbage_keeps_following_slot_aligned() {
    let (client, result) = execute_two_gets_against(b"?x\r\n$1\r\n7\r\n");
    let replies = result.expect("execute");
    assert!(matches!(replies[0], Err(ClientError::Protocol(_))));
    assert_eq!(*replies[1].as_ref().expect("bulk"), bulk(b"7"));
    assert_eq!(client.pool().total_count(), 0);
}

#[test]
fn connection_is_reused_across_executes() {
    let (addr, server) = spawn_server(|listener| {
        let (mut reader, mut stream) = accept(&listener);
        for _ in 0..2 {
            read_commands(&mut reader, 1);
            reply(&mut stream, b"+PONG\r\n");
        }
    });

    let client = client_for(addr);
    let mut pipeline = client.pipeline();
    for _ in 0..2 {
        pipeline.ping();
        let replies = values(pipeline.execute().expect("execute"));
        assert_eq!(replies, vec![RespValue::Simple(b"PONG".to_vec())]);
        assert_eq!(client.pool().total_count(), 1);
    }
    server.join().expect("server");
}

#[test]
fn stale_connection_is_replaced_and_batch_resent() {
    let (tx, rx) = mpsc::channel();
    let (addr, server) = spawn_server(move |listener| {
        let (mut reader, stream) = accept(&listener);
        let first = read_commands(&mut reader, 3);
        // Close without replying: the client sees end-of-stream on its first read.
        drop(reader);
        drop(stream);

        let (mut reader, mut stream) = accept(&listener);
        let second = read_commands(&mut reader, 3);
        assert_eq!(first, second);
        reply(&mut stream, b"+OK\r\n:2\r\n$1\r\n2\r\n");
        tx.send(second).expect("send");
    });

    let client = client_for(addr);
    let mut pipeline = client.pipeline();
    pipeline.set(b"k", b"1").incr(b"k").get(b"k");
    let replies = values(pipeline.execute().expect("execute"));

    assert_eq!(
        replies,
        vec![RespValue::Simple(b"OK".to_vec()), RespValue::Integer(2), bulk(b"2")]
    );
    assert_eq!(
        rx.recv().expect("resent batch"),
        vec![args(&["SET", "k", "1"]), args(&["INCR", "k"]), args(&["GET", "k"])]
    );
    // The replacement connection served the batch and goes back to the pool.
    assert_eq!(client.pool().idle_count(), 1);
    assert_eq!(client.pool().total_count(), 1);
    server.join().expect("server");
}

#[test]
fn retry_happens_at_most_once() {
    let (tx, rx) = mpsc::channel();
    let (addr, server) = spawn_server(move |listener| {
        for _ in 0..2 {
            let (mut reader, _stream) = accept(&listener);
            read_commands(&mut reader, 1);
        }
        thread::sleep(Duration::from_millis(300));
        tx.send(has_pending_connection(&listener)).expect("send");
    });

    let client = client_for(addr);
    let mut pipeline = client.pipeline();
    pipeline.incr(b"n");
    let err = pipeline.execute().unwrap_err();

    assert!(err.is_end_of_stream());
    assert!(pipeline.is_empty());
    assert!(!rx.recv().expect("third dial check"));
    assert_eq!(client.pool().total_count(), 0);
    server.join().expect("server");
}

#[test]
fn timeout_is_not_retried() {
    let (tx, rx) = mpsc::channel();
    let (addr, server) = spawn_server(move |listener| {
        let (mut reader, stream) = accept(&listener);
        read_commands(&mut reader, 1);
        // Hold the connection open past the client's read timeout.
        thread::sleep(Duration::from_millis(600));
        tx.send(has_pending_connection(&listener)).expect("send");
        drop(stream);
    });

    let client = client_with(addr, 2, Duration::from_millis(150));
    let mut pipeline = client.pipeline();
    pipeline.get(b"slow");
    let err = pipeline.execute().unwrap_err();

    assert!(matches!(err, ClientError::Io(_)));
    assert!(!err.is_end_of_stream());
    assert!(!rx.recv().expect("second dial check"));
    assert_eq!(client.pool().total_count(), 0);
    server.join().expect("server");
}

#[test]
fn end_of_stream_after_first_reply_is_fatal() {
    let (tx, rx) = mpsc::channel();
    let (addr, server) = spawn_server(move |listener| {
        let (mut reader, mut stream) = accept(&listener);
        read_commands(&mut reader, 2);
        reply(&mut stream, b"+OK\r\n");
        drop(reader);
        drop(stream);
        thread::sleep(Duration::from_millis(300));
        tx.send(has_pending_connection(&listener)).expect("send");
    });

    let client = client_for(addr);
    let mut pipeline = client.pipeline();
    pipeline.set(b"k", b"v").get(b"k");
    let err = pipeline.execute().unwrap_err();

    assert!(err.is_end_of_stream());
    assert!(!rx.recv().expect("second dial check"));
    server.join().expect("server");
}

#[test]
fn pool_exhaustion_fails_call_and_clears_batch() {
    let client = client_with("127.0.0.1:1".to_string(), 0, Duration::from_secs(1));
    let mut pipeline = client.pipeline();
    pipeline.get(b"k").get(b"other");

    let err = pipeline.execute().unwrap_err();

    assert!(matches!(err, ClientError::PoolExhausted));
    assert!(pipeline.is_empty());
    pipeline.get(b"k");
    assert_eq!(pipeline.len(), 1);
}

#[test]
fn empty_pipeline_does_not_dial() {
    let (addr, server) = spawn_server(|listener| {
        thread::sleep(Duration::from_millis(200));
        assert!(!has_pending_connection(&listener));
    });

    let client = client_for(addr);
    let mut pipeline = client.pipeline();
    assert!(pipeline.execute().expect("execute").is_empty());
    assert_eq!(client.pool().total_count(), 0);
    server.join().expect("server");
}

#[test]
fn pipelines_on_separate_threads_use_separate_connections() {
    let (addr, server) = spawn_server(|listener| {
        let handlers: Vec<_> = (0..2)
            .map(|_| {
                let (mut reader, mut stream) = accept(&listener);
                thread::spawn(move || {
                    let commands = read_commands(&mut reader, 1);
                    let key = commands[0][1].clone();
                    let mut raw = format!("${}\r\n", key.len()).into_bytes();
                    raw.extend_from_slice(&key);
                    raw.extend_from_slice(b"\r\n");
                    reply(&mut stream, &raw);
                })
            })
            .collect();
        for handler in handlers {
            handler.join().expect("handler");
        }
    });

    let client = client_with(addr, 2, Duration::from_secs(2));
    let workers: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|key| {
            let client = client.clone();
            thread::spawn(move || {
                let mut pipeline = client.pipeline();
                pipeline.get(key.as_bytes());
                let replies = values(pipeline.execute().expect("execute"));
                assert_eq!(replies, vec![bulk(key.as_bytes())]);
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }
    server.join().expect("server");
}

#[test]
fn query_maps_error_reply_to_server_error() {
    let (addr, server) = spawn_server(|listener| {
        let (mut reader, mut stream) = accept(&listener);
        let commands = read_commands(&mut reader, 1);
        assert_eq!(commands[0], args(&["LPOP", "k"]));
        reply(&mut stream, b"-ERR boom\r\n");

        let commands = read_commands(&mut reader, 1);
        assert_eq!(commands[0], args(&["GET", "k"]));
        reply(&mut stream, b"$-1\r\n");
    });

    let client = client_for(addr);
    let err = client.query(Command::new("lpop").arg("k")).unwrap_err();
    match err {
        ClientError::Server { message } => assert_eq!(message, b"ERR boom".to_vec()),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(client.get(b"k").expect("get"), None);
    server.join().expect("server");
}
