use std::io::Write;
fn main() {
    let td = tempfile::tempdir().unwrap();
    let tarp = td.path().join("a.tar");
    let dest = td.path().join("out");
    std::fs::create_dir(&dest).unwrap();
    {
        let fh = std::fs::File::create(&tarp).unwrap();
        let mut b = tar::Builder::new(fh);
        let mut hdr = tar::Header::new_gnu();
        hdr.set_size(7);
        hdr.set_mode(0o644);
        hdr.set_cksum();
        b.append_data(&mut hdr, "abcd", &b"payload"[..]).unwrap();
        b.finish().unwrap();
    }
    let fh = std::fs::File::open(&tarp).unwrap();
    let mut ar = tar::Archive::new(fh);
    ar.set_preserve_ownerships(true);
    for ent in ar.entries().unwrap() {
        let mut ent = ent.unwrap();
        println!("uid field raw: {:?}", ent.header().as_bytes()[108..116].to_vec());
        let dst = dest.join("abcd");
        ent.unpack(&dst).unwrap();
    }
}
