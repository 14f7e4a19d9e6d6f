use keyscope_client::{init_tracing, run, ClientConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    run(ClientConfig::from_env()).await
}
