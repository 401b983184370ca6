use joyrpc::Service;
use serde::{Deserialize, Serialize};

pub const INTERFACE: &str = "io.joyrpc.demo.Echo";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GreetRequest {
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GreetReply {
    pub message: String,
    pub serial: u64,
}

/// Demo service: `echo` reverses the input, `greet` counts greetings.
#[must_use]
pub fn demo_service() -> Service {
    let counter = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
    let mut service = Service::new(INTERFACE);
    service.method("echo", |req: String| async move {
        Ok(req.chars().rev().collect::<String>())
    });
    service.method("greet", move |req: GreetRequest| {
        let counter = counter.clone();
        async move {
            let serial = counter.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            Ok(GreetReply {
                message: format!("hello {}!", req.name),
                serial,
            })
        }
    });
    service
}
