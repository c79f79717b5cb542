//! Objects crossing more than one session.

mod common;

use std::rc::Rc;

use common::{init_tracing, wait_until, Broker, Calculator, Counter, Holder};
use netron::{Context, Netron, NetronError, PeerOptions, Status, Value};
use tokio::task::LocalSet;

#[tokio::test]
async fn test_third_party_object_is_proxied() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let a = Netron::new(PeerOptions::local_network());
            let b = Netron::new(PeerOptions::local_network());
            let c = Netron::new(PeerOptions::local_network());

            let calc_id = c
                .attach_context(Rc::new(Calculator::default()), "calc")
                .await
                .expect("attach calc");
            let broker = Rc::new(Broker::default());
            b.attach_context(broker.clone(), "broker")
                .await
                .expect("attach broker");

            let (b_to_c, _) = b.connect_local(&c).await.expect("connect b-c");
            broker.set_target(b_to_c.get_interface_by_name("calc").expect("calc"));
            let (a_to_b, _) = a.connect_local(&b).await.expect("connect a-b");

            let remote_broker = a_to_b.get_interface_by_name("broker").expect("broker");
            let calc = remote_broker
                .call("target", Vec::new())
                .await
                .expect("target")
                .into_interface()
                .expect("interface");

            assert_eq!(calc.definition().parent_id, Some(calc_id));
            assert_eq!(calc.definition().owner, Some(a.uid()));
            assert_eq!(
                calc.call("add", vec![Value::Int(1), Value::Int(2)]).await,
                Ok(Value::Int(3))
            );
            assert_eq!(b.stub_count(), 2);

            let again = remote_broker
                .call("target", Vec::new())
                .await
                .expect("target")
                .into_interface()
                .expect("interface");
            assert_eq!(again.def_id(), calc.def_id());
            assert_eq!(b.stub_count(), 2);

            b_to_c.disconnect().await.expect("disconnect");
            assert_eq!(b_to_c.status(), Status::Offline);
            assert_eq!(b.stub_count(), 1);

            let result = calc.call("add", vec![Value::Int(1)]).await;
            match result {
                Err(NetronError::Remote(error)) => assert_eq!(error.kind, "NotExists"),
                other => panic!("expected a remote NotExists, got {other:?}"),
            }
        })
        .await;
}

#[tokio::test]
async fn test_object_argument_calls_back() {
    LocalSet::new()
        .run_until(async {
            let a = Netron::new(PeerOptions::local_network());
            let b = Netron::new(PeerOptions::local_network());
            b.attach_context(Rc::new(Broker::default()), "broker")
                .await
                .expect("attach");
            let (a_to_b, b_to_a) = a.connect_local(&b).await.expect("connect");
            let broker = a_to_b.get_interface_by_name("broker").expect("broker");

            let counter = Rc::new(Counter::default());
            let exposed: Rc<dyn Context> = counter.clone();

            let result = broker
                .call("invoke", vec![Value::Context(exposed.clone())])
                .await;
            assert_eq!(result, Ok(Value::Int(1)));
            assert_eq!(counter.value(), 1);
            assert_eq!(a.stub_count(), 1);

            let echoed = broker
                .call("echo", vec![Value::Context(exposed.clone())])
                .await
                .expect("echo");
            assert_eq!(echoed, Value::Context(exposed));
            assert_eq!(a.stub_count(), 1);

            b_to_a.disconnect().await.expect("disconnect");
            wait_until(|| a_to_b.status() == Status::Offline).await;
            assert_eq!(a.stub_count(), 0);
        })
        .await;
}

#[tokio::test]
async fn test_proxy_survives_detach_of_context_with_same_id() {
    LocalSet::new()
        .run_until(async {
            let a = Netron::new(PeerOptions::local_network());
            let b = Netron::new(PeerOptions::local_network());
            let c = Netron::new(PeerOptions::local_network());

            let calc_id = c
                .attach_context(Rc::new(Calculator::default()), "calc")
                .await
                .expect("attach calc");
            let broker = Rc::new(Broker::default());
            let broker_id = b
                .attach_context(broker.clone(), "broker")
                .await
                .expect("attach broker");
            assert_eq!(calc_id, broker_id);

            let (b_to_c, _) = b.connect_local(&c).await.expect("connect b-c");
            broker.set_target(b_to_c.get_interface_by_name("calc").expect("calc"));
            let (a_to_b, _) = a.connect_local(&b).await.expect("connect a-b");

            let calc = a_to_b
                .get_interface_by_name("broker")
                .expect("broker")
                .call("target", Vec::new())
                .await
                .expect("target")
                .into_interface()
                .expect("interface");
            assert_eq!(b.stub_count(), 2);

            b.detach_context("broker").await.expect("detach");
            assert_eq!(b.stub_count(), 1);
            assert_eq!(
                calc.call("add", vec![Value::Int(1), Value::Int(2)]).await,
                Ok(Value::Int(3))
            );
        })
        .await;
}

#[tokio::test]
async fn test_shared_object_gets_a_stub_per_peer() {
    LocalSet::new()
        .run_until(async {
            let a = Netron::new(PeerOptions::local_network());
            let b = Netron::new(PeerOptions::local_network());
            let c = Netron::new(PeerOptions::local_network());
            let counter = Rc::new(Counter::default());
            a.attach_context(Rc::new(Holder::new(counter.clone())), "holder")
                .await
                .expect("attach");

            let (b_to_a, _) = b.connect_local(&a).await.expect("connect b-a");
            let (c_to_a, _) = c.connect_local(&a).await.expect("connect c-a");

            let from_b = b_to_a
                .get_interface_by_name("holder")
                .expect("holder")
                .call("child", Vec::new())
                .await
                .expect("child")
                .into_interface()
                .expect("interface");
            let from_c = c_to_a
                .get_interface_by_name("holder")
                .expect("holder")
                .call("child", Vec::new())
                .await
                .expect("child")
                .into_interface()
                .expect("interface");

            assert_eq!(from_b.definition().owner, Some(b.uid()));
            assert_eq!(from_c.definition().owner, Some(c.uid()));
            assert_ne!(from_b.def_id(), from_c.def_id());
            assert_eq!(a.stub_count(), 3);

            assert_eq!(from_b.call("increment", Vec::new()).await, Ok(Value::Int(1)));
            b_to_a.disconnect().await.expect("disconnect");
            wait_until(|| a.stub_count() == 2).await;

            assert_eq!(from_c.call("increment", Vec::new()).await, Ok(Value::Int(2)));
            assert_eq!(counter.value(), 2);
        })
        .await;
}
