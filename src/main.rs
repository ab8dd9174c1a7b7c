use clap::Parser;
use tessella::Args;

// --------------------------------------------------
fn main() {
    if let Err(e) = tessella::run(Args::parse()) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
