use hangwatch::{clean_logger, cli};
use log::error;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let res = cli::run().await;
    if let Err(err) = res {
        if log::max_level() > log::LevelFilter::Off {
            error!("{err:#}");
        } else {
            eprintln!("Error: {err:#}");
        }
        clean_logger();
        std::process::exit(1);
    }
}
