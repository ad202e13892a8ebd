mod args;
mod cache;
mod cmd;
mod config;
mod delegate;
mod error;
mod exec;
mod kubernetes;
#[cfg(test)]
mod mock;
mod resolver;
mod result;
mod trace;
mod version;

#[tokio::main]
async fn main() {
    std::process::exit(cmd::run().await);
}
