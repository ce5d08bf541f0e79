mod cli;
mod collection;
mod commands;
mod env_loader;
mod error;
mod harvest;
mod logging;
mod remote;

fn main() {
    env_loader::load_dotenv();

    if let Err(err) = cli::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
