use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    sumarai::run().await
}
