fn main() -> anyhow::Result<()> {
    procman_deputy::pm::main()
}
