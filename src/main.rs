fn main() -> anyhow::Result<()> {
    phasegate::run()?;
    Ok(())
}
