use clap::Parser;

fn main() -> eyre::Result<()> {
    let args = ao_loop::supervisor::CliArgs::parse();
    ao_loop::supervisor::run(args)
}
