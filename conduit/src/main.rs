use conduit::cli::initialize_from_arguments;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("conduit v{}", env!("CARGO_PKG_VERSION"));
    initialize_from_arguments().await?;
    println!("Done");
    Ok(())
}
