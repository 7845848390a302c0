use super::*;
use crate::{
    header,
    service::{CopyFactory, HeaderStackingFactory, RegexFactory},
};
use std::io;
use tokio::{
    io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    task::JoinHandle,
};

fn config() -> DispatchConfig {
    DispatchConfig {
        workers: 4,
        create_timeout: Duration::from_millis(200),
        shutdown_timeout: Duration::from_millis(200),
        defaults: None,
    }
}

async fn spawn_server<F: ServiceFactory>(
    factory: F,
    config: DispatchConfig,
) -> (Arc<DispatchServer<F>>, SocketAddr, JoinHandle<Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(DispatchServer::new(factory, config).unwrap());
    let handle = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run(listener).await }
    });
    (server, addr, handle)
}

async fn exchange(addr: SocketAddr, request: &[u8]) -> io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request).await?;
    stream.shutdown().await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(response)
}

async fn round_trip(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    exchange(addr, request).await.unwrap()
}

/// Writes a little output, then fails without reading its input.
struct BrokenFactory;

struct BrokenService(Option<io::Error>);

impl Service for BrokenService {
    async fn run<R, W>(&mut self, _input: &mut R, output: &mut W)
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let _ = output.write_all(b"partial").await;
        let _ = output.flush().await;
        self.0 = Some(io::Error::other("filter broke"));
    }

    fn error(&self) -> Option<&io::Error> {
        self.0.as_ref()
    }
}

impl ServiceFactory for BrokenFactory {
    type Service = BrokenService;

    async fn create_service<R>(
        &self,
        _input: &mut R,
        _param: Option<Params>,
    ) -> core::result::Result<BrokenService, CreateError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        Ok(BrokenService(None))
    }
}

#[test]
fn zero_workers_is_rejected() {
    let config = DispatchConfig {
        workers: 0,
        ..DispatchConfig::default()
    };
    let err = DispatchServer::new(CopyFactory, config).err().unwrap();
    assert!(err.is_argument());
}

#[tokio::test]
async fn echoes_through_a_header_stacking_copy_service() {
    let (server, addr, handle) =
        spawn_server(HeaderStackingFactory::new(CopyFactory), config()).await;

    let mut request = header::encode([("ignored", "by copy")]);
    request.extend_from_slice(b"payload bytes");
    assert_eq!(round_trip(addr, &request).await, b"payload bytes");

    server.shutdown().await;
    handle.await.unwrap().unwrap();
    let stats = server.stats();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn regex_service_reads_its_parameters_from_the_header() {
    let (server, addr, handle) =
        spawn_server(HeaderStackingFactory::new(RegexFactory), config()).await;

    let mut request = header::encode([("pattern", "o+"), ("replace", "0")]);
    request.extend_from_slice(b"foo\nboo\n");
    assert_eq!(round_trip(addr, &request).await, b"f0\nb0\n");

    server.shutdown().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn header_parameters_override_server_defaults() {
    let defaults: Params = [("pattern", "a"), ("replace", "4")].into_iter().collect();
    let (server, addr, handle) = spawn_server(
        HeaderStackingFactory::new(RegexFactory),
        DispatchConfig {
            defaults: Some(defaults),
            ..config()
        },
    )
    .await;

    let mut request = header::encode(Vec::<(&str, &str)>::new());
    request.extend_from_slice(b"banana\n");
    assert_eq!(round_trip(addr, &request).await, b"b4n4n4\n");

    let mut request = header::encode([("replace", "_")]);
    request.extend_from_slice(b"banana\n");
    assert_eq!(round_trip(addr, &request).await, b"b_n_n_\n");

    server.shutdown().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_header_resets_the_connection() {
    let (server, addr, handle) =
        spawn_server(HeaderStackingFactory::new(CopyFactory), config()).await;

    // A rejection must not look like a service that produced no output.
    assert!(exchange(addr, b"no separator\n\npayload").await.is_err());
    assert_eq!(server.stats().rejected, 1);

    server.shutdown().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn slow_header_times_out_as_a_rejection() {
    let (server, addr, handle) =
        spawn_server(HeaderStackingFactory::new(CopyFactory), config()).await;

    // Connect but never send the header.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut response = Vec::new();
    let read = timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .unwrap();
    assert_eq!(read.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
    assert!(response.is_empty());
    assert_eq!(server.stats().rejected, 1);

    server.shutdown().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_service_resets_the_connection() {
    let (server, addr, handle) = spawn_server(BrokenFactory, config()).await;

    assert!(exchange(addr, b"unread input").await.is_err());
    let stats = server.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);

    server.shutdown().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn lifecycle_transitions() {
    let (server, _addr, handle) = spawn_server(CopyFactory, config()).await;
    while server.state() != ServerState::Running {
        tokio::task::yield_now().await;
    }
    assert!(server.local_addr().is_some());

    let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
    assert!(matches!(
        server.run(second).await,
        Err(Error::AlreadyRunning)
    ));

    server.shutdown().await;
    server.shutdown().await;
    assert_eq!(server.state(), ServerState::ShutDown);
    timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let third = TcpListener::bind("127.0.0.1:0").await.unwrap();
    assert!(matches!(server.run(third).await, Err(Error::ShutDown)));
}

#[tokio::test]
async fn shutdown_closes_the_listener() {
    let (server, addr, handle) = spawn_server(CopyFactory, config()).await;
    while server.state() != ServerState::Running {
        tokio::task::yield_now().await;
    }
    server.shutdown().await;
    handle.await.unwrap().unwrap();
    assert!(TcpStream::connect(addr).await.is_err());
}
