#[cfg(windows)]
fn main() {
    let mut res = winres::WindowsResource::new();
    res.set("ProductName", "Clarity Layer");
    res.set("FileDescription", "Clarity Layer - Visual Accessibility Overlay");
    res.set("LegalCopyright", "© 2026 Clarity Layer Contributors");
    res.set("CompanyName", "Clarity Layer");
    res.set("OriginalFilename", "claritylayer.exe");

    if let Err(e) = res.compile() {
        eprintln!("Failed to compile Windows resource: {}", e);
    }
}

#[cfg(not(windows))]
fn main() {
}
