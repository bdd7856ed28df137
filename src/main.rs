fn main() -> anyhow::Result<()> {
    watchlink_lib::run()
}
