use gateway::stores::memory::MemoryStores;

#[tokio::main]
async fn main() -> gateway::Result<()> {
    gateway::init_tracing();
    tracing::info!(version = gateway::version::VERSION, "gateway starting");
    // Development wiring; production deployments embed the gateway as a
    // library and pass adapters to the real data store and token service.
    gateway::run(MemoryStores::new().into()).await
}
