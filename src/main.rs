fn main() {
    if let Err(err) = secattest::cli::run() {
        secattest::ui::eprintln_error(&err);
        std::process::exit(secattest::exit::exit_code(&err));
    }
}
