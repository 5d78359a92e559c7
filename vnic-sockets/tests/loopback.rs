//! Two clients talking through a `LoopbackDevice`.
//!
//! One client listens on a virtual port and echoes; the other connects to it.
//! Every byte crosses two reverse tunnels and the device's forwarding table.

mod common;

use std::sync::Arc;

use common::{eventually, start_server, within};
use vnic_sockets::loopback::DEFAULT_ADDRESS;
use vnic_sockets::{
    open_socket, CallbackListener, Config, FlowChannel, FlowKey, LoopbackDevice, OpenIntent,
    SpawnFailurePolicy,
};

async fn callback_listener(config: &Config) -> Arc<vnic_sockets::CallbackRegistry> {
    let listener = CallbackListener::bind("127.0.0.1:0", config)
        .await
        .expect("bind callback listener");
    let registry = listener.registry();
    tokio::spawn(listener.run());
    registry
}

#[tokio::test]
async fn connect_to_local_listener_round_trips_bytes() {
    let device = Arc::new(LoopbackDevice::default());
    let config = Config::default();
    let addr = start_server(device.clone(), config.clone()).await;

    // Listener side: accept flows and echo them.
    let (listen_factory, mut accepted) = FlowChannel::factory();
    let listening = open_socket(
        addr,
        OpenIntent::Listen { source_port: 8080 },
        callback_listener(&config).await,
        listen_factory,
        &config,
    )
    .await
    .expect("listen");
    assert_eq!(listening.port(), 8080);
    assert!(device.is_port_open(8080));

    // Connect side.
    let (connect_factory, mut connected) = FlowChannel::factory();
    let outbound = open_socket(
        addr,
        OpenIntent::Connect {
            destination: DEFAULT_ADDRESS.into(),
            destination_port: 8080,
        },
        callback_listener(&config).await,
        connect_factory,
        &config,
    )
    .await
    .expect("connect");
    let local_port = outbound.port();

    let mut client = within("outbound flow", connected.recv()).await.unwrap();
    let mut server = within("inbound flow", accepted.recv()).await.unwrap();
    assert_eq!(
        client.flow(),
        &FlowKey::new(DEFAULT_ADDRESS, local_port, DEFAULT_ADDRESS, 8080)
    );
    assert_eq!(server.flow(), &client.flow().reversed());

    assert!(client.write(b"ping"));
    let got = within("server receives", server.recv()).await.unwrap();
    assert_eq!(got, b"ping");

    assert!(server.write(b"pong"));
    let got = within("client receives", client.recv()).await.unwrap();
    assert_eq!(got, b"pong");

    // Dropping the connecting client's channel tears the flow down on both sides.
    outbound.close().await.unwrap();
    let end = within("server flow closed", server.recv()).await;
    assert_eq!(end, None);
    eventually("forwarding table drained", || device.connection_count() == 0).await;
    assert!(!device.is_port_open(local_port));
    assert!(device.is_port_open(8080));

    listening.close().await.unwrap();
    eventually("listening port released", || !device.is_port_open(8080)).await;
}

#[tokio::test]
async fn connect_without_listener_is_refused() {
    let device = Arc::new(LoopbackDevice::default());
    let config = Config {
        spawn_failure: SpawnFailurePolicy::DropFlow,
        ..Config::default()
    };
    let addr = start_server(device, config.clone()).await;
    let (factory, _flows) = FlowChannel::factory();

    let result = open_socket(
        addr,
        OpenIntent::Connect {
            destination: DEFAULT_ADDRESS.into(),
            destination_port: 9999,
        },
        callback_listener(&config).await,
        factory,
        &config,
    )
    .await;

    match result {
        Err(vnic_sockets::Error::OpenRejected { code, .. }) => {
            assert_eq!(code, vnic_sockets::ErrorCode::Unknown);
        }
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("connect should be refused"),
    }
}
