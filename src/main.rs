#[tokio::main]
async fn main() {
    if let Err(e) = redflag_lib::run().await {
        eprintln!("redflag: {e}");
        std::process::exit(1);
    }
}
