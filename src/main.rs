#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    visit_service::run_service().await
}
