use anyhow::Result;

fn main() -> Result<()> {
    seqbox::cli::run()
}
