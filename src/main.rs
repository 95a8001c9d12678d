#[tokio::main]
async fn main() {
    chart_pipeline_lib::init_tracing();

    if let Err(error) = chart_pipeline_lib::run().await {
        tracing::error!("chart session failed: {error}");
        std::process::exit(1);
    }
}
