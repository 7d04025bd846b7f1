fn main() {
    rapport::logging::init();
    if let Err(err) = rapport::cli::main() {
        eprintln!("❌ Error: {err}");
        std::process::exit(1);
    }
}
