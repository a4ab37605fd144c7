use herald_core::{
    Account, AccountRegistry, ChainKdfEngine, InMemoryDirectory, InMemoryStorage,
    InMemoryTransport, InboundEvent, MessagePipeline, PipelineConfig, ProvisioningRequest,
};
use std::sync::Arc;
use std::time::Duration;

/// One device under test: its account, pipeline, transport, and event feed.
pub struct TestNode {
    pub registry: Arc<AccountRegistry>,
    pub account: Arc<Account>,
    pub pipeline: MessagePipeline,
    pub events: crossbeam_channel::Receiver<InboundEvent>,
    pub transport: Arc<InMemoryTransport>,
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        max_attempts: 3,
        base_backoff: Duration::from_millis(1),
        sealed_sender: true,
    }
}

pub fn register(directory: &Arc<InMemoryDirectory>, id: &str) -> TestNode {
    let registry = Arc::new(AccountRegistry::new(Arc::new(InMemoryStorage::new())).unwrap());
    let flow = registry.register(id).unwrap();
    let code = registry.issued_code(&flow).unwrap();
    registry.verify(&flow, &code).unwrap();
    let account = registry.complete_registration(&flow).unwrap();

    node_for(registry, account, directory)
}

/// Link a secondary device onto `primary`'s registry and identity.
pub fn link(
    primary: &TestNode,
    directory: &Arc<InMemoryDirectory>,
) -> TestNode {
    let registry = primary.registry.clone();
    let request = ProvisioningRequest::new(primary.account.id());
    let token = request.token.clone();
    let flow = registry.link_device(request).unwrap();
    let account = registry.confirm_link(&flow, &token).unwrap();

    node_for(registry, account, directory)
}

fn node_for(
    registry: Arc<AccountRegistry>,
    account: Arc<Account>,
    directory: &Arc<InMemoryDirectory>,
) -> TestNode {
    directory.publish(account.clone());
    let transport = Arc::new(InMemoryTransport::new());
    let (pipeline, events) = MessagePipeline::new(
        account.clone(),
        Arc::new(ChainKdfEngine::new()),
        transport.clone(),
        directory.clone(),
        test_config(),
    );
    TestNode {
        registry,
        account,
        pipeline,
        events,
        transport,
    }
}

/// Carry every in-flight envelope to the node owning its recipient address,
/// until the network is quiet.
pub fn pump(nodes: &[&TestNode]) {
    loop {
        let mut moved = false;
        for node in nodes {
            for envelope in node.transport.take_delivered() {
                moved = true;
                let target = nodes.iter().find(|n| {
                    n.account.id() == envelope.recipient.peer
                        && n.account.device_id() == envelope.recipient.device_id
                });
                if let Some(target) = target {
                    let _ = target.pipeline.receive(&envelope);
                }
            }
        }
        if !moved {
            break;
        }
    }
}

/// Drain everything currently queued on a node's event feed.
pub fn drain_events(node: &TestNode) -> Vec<InboundEvent> {
    let mut events = Vec::new();
    while let Ok(event) = node.events.try_recv() {
        events.push(event);
    }
    events
}
