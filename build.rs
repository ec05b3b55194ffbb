fn main() {
    if !cfg!(target_os = "linux") {
        panic!("{} only works on linux", env!("CARGO_PKG_NAME"));
    }
    if !cfg!(target_arch = "x86_64") {
        panic!("{} host integration only supports x86_64", env!("CARGO_PKG_NAME"));
    }
}
