fn main() {
    if let Err(err) = tabmerge::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
