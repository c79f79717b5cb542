//! Calculator served over TCP.
//!
//! Starts a server runtime exposing a `calc` context on a local port, then
//! connects a client runtime to it and performs a few calls.
//!
//! ```bash
//! cargo run -p netron --example calculator
//! ```

use std::cell::Cell;
use std::rc::Rc;

use async_trait::async_trait;
use netron::{
    Context, Member, Netron, NetronError, NetronResult, PeerOptions, TcpTransport, Value,
};
use tokio::net::TcpListener;
use tokio::task::LocalSet;

#[derive(Default)]
struct Calculator {
    memory: Cell<i64>,
}

#[async_trait(?Send)]
impl Context for Calculator {
    fn name(&self) -> &str {
        "Calculator"
    }

    fn members(&self) -> Vec<(String, Member)> {
        vec![
            ("add".to_string(), Member::Method),
            ("memory".to_string(), Member::Property { readonly: false }),
        ]
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> NetronResult<Value> {
        match method {
            "add" => Ok(Value::Int(args.iter().filter_map(Value::as_i64).sum())),
            _ => Err(NetronError::NotImplemented("call")),
        }
    }

    async fn get(&self, _property: &str) -> NetronResult<Value> {
        Ok(Value::Int(self.memory.get()))
    }

    async fn set(&self, _property: &str, value: Value) -> NetronResult<()> {
        let memory = value
            .as_i64()
            .ok_or_else(|| NetronError::IllegalState("memory holds integers".to_string()))?;
        self.memory.set(memory);
        Ok(())
    }
}

async fn run() -> NetronResult<()> {
    let server = Netron::new(PeerOptions::local_network());
    server
        .attach_context(Rc::new(Calculator::default()), "calc")
        .await?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    tracing::info!(%addr, uid = %server.uid(), "server listening");

    let acceptor = server.clone();
    tokio::task::spawn_local(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    tracing::info!(%remote, "connection accepted");
                    let (transport, rx) = TcpTransport::from_stream(stream);
                    acceptor.accept(transport, rx);
                }
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                    break;
                }
            }
        }
    });

    let client = Netron::new(PeerOptions::local_network());
    let (transport, rx) = TcpTransport::new(addr, PeerOptions::local_network());
    let peer = client.connect(transport, rx).await?;
    tracing::info!(contexts = ?peer.remote_contexts(), "connected");

    let calc = peer.get_interface_by_name("calc")?;
    let sum = calc
        .call("add", vec![Value::Int(19), Value::Int(23)])
        .await?;
    tracing::info!(?sum, "add(19, 23)");

    calc.set("memory", sum).await?;
    let memory = calc.get("memory").await?;
    tracing::info!(?memory, "memory");

    peer.disconnect().await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    if let Err(error) = LocalSet::new().run_until(run()).await {
        tracing::error!(%error, "calculator example failed");
    }
}
