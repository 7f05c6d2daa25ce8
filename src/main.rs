fn main() -> tt::Result<()> {
    tt::cli::main()
}
