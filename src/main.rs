#[tokio::main]
async fn main() {
    if let Err(e) = fieldsync::run().await {
        eprintln!("fieldsync: {}", e);
        std::process::exit(1);
    }
}
