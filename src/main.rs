#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sleepalarm_lib::run().await
}
