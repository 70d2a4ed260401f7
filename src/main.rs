#[cfg(feature = "server")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    socratic_parent::server::run().await
}
