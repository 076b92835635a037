fn main() -> anyhow::Result<()> {
    retrain_core::run()
}
