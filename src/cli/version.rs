/// Display version information
pub fn execute() {
    println!("switchboard {}", env!("CARGO_PKG_VERSION"));
    println!("Multi-instance session manager with webhook fan-out");
}
