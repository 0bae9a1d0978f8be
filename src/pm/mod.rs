pub mod build_info;
pub mod cli;
pub mod deputy;
pub mod exec_string;
pub mod log;
pub mod messages;
pub mod procinfo;
pub mod procman;
pub mod reactor;
pub mod transport;

pub fn main() -> anyhow::Result<()> {
    cli::run()
}
