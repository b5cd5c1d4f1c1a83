//! Segment tables produced from ELF images.

mod common;

use common::{ET_DYN, ElfImage, PF_R, PF_W, PF_X, PT_PHDR, Phdr};
use lazyload::{
    DescriptorProvider, ElfProvider, LoaderError, PageSize, ParseError, Permission, Va,
    loader::elf::parse_image,
};

fn ps() -> PageSize {
    PageSize::new(0x1000).unwrap()
}

fn two_segments() -> ElfImage {
    ElfImage::new(0x40_1000)
        .with(Phdr::load(0x40_1000, 0x1000, &[0xcc; 0x80], 0x80, PF_R | PF_X))
        .with(Phdr::load(0x40_3000, 0x2000, &[7; 0x10], 0x1800, PF_R | PF_W))
}

#[test]
fn load_headers_become_segments() {
    let table = parse_image(&two_segments().bytes(), ps()).unwrap();
    assert_eq!(table.entry(), Va::new(0x40_1000));
    let segments = table.segments();
    assert_eq!(segments.len(), 2, "every PT_LOAD should become a segment");

    assert_eq!(segments[0].virtual_address, Va::new(0x40_1000));
    assert_eq!(segments[0].file_offset, 0x1000);
    assert_eq!(segments[0].file_size, 0x80);
    assert_eq!(segments[0].memory_size, 0x80);
    assert_eq!(segments[0].permissions, Permission::READ | Permission::EXECUTABLE);

    assert_eq!(segments[1].virtual_address, Va::new(0x40_3000));
    assert_eq!(segments[1].file_size, 0x10);
    assert_eq!(segments[1].memory_size, 0x1800);
    assert_eq!(segments[1].permissions, Permission::READ | Permission::WRITE);

    assert_eq!(
        table.program_headers(),
        None,
        "no segment covers the program headers in the file"
    );
}

#[test]
fn image_need_not_be_aligned() {
    let mut buffer = vec![0u8];
    buffer.extend_from_slice(&two_segments().bytes());
    let table = parse_image(&buffer[1..], ps()).unwrap();
    assert_eq!(
        table.segments().len(),
        2,
        "an image at an odd address should parse like any other"
    );
}

#[test]
fn program_headers_are_located() {
    // The first segment maps the start of the file, headers included.
    let image = ElfImage::new(0x40_0100)
        .with(Phdr::load(0x40_0000, 0, &[0; 0x200], 0x200, PF_R | PF_X));
    let table = parse_image(&image.bytes(), ps()).unwrap();
    let phdrs = table.program_headers().unwrap();
    assert_eq!(phdrs.address, Va::new(0x40_0040));
    assert_eq!(phdrs.entry_size, 56);
    assert_eq!(phdrs.count, 1);

    let image = two_segments().with(Phdr {
        p_type: PT_PHDR,
        flags: PF_R,
        offset: 64,
        vaddr: 0x50_0040,
        data: Vec::new(),
        memsz: 0,
    });
    let table = parse_image(&image.bytes(), ps()).unwrap();
    assert_eq!(
        table.program_headers().map(|p| (p.address, p.count)),
        Some((Va::new(0x50_0040), 3)),
        "PT_PHDR should win"
    );
}

#[test]
fn unsupported_images_are_rejected() {
    let mut image = two_segments();
    image.machine = 0x1234;
    assert_eq!(
        parse_image(&image.bytes(), ps()).err(),
        Some(ParseError::WrongMachine(0x1234))
    );

    let mut image = two_segments();
    image.e_type = ET_DYN;
    assert_eq!(
        parse_image(&image.bytes(), ps()).err(),
        Some(ParseError::NotExecutable(ET_DYN)),
        "position-independent executables should be rejected"
    );

    assert_eq!(
        parse_image(&two_segments().with_interp().bytes(), ps()).err(),
        Some(ParseError::DynamicallyLinked)
    );

    assert_eq!(
        parse_image(&ElfImage::new(0).bytes(), ps()).err(),
        Some(ParseError::NoSegments)
    );
}

#[test]
fn broken_segments_are_rejected() {
    let mut image = two_segments();
    image.truncate_to = Some(0x2008);
    assert_eq!(
        parse_image(&image.bytes(), ps()).err(),
        Some(ParseError::FileRange {
            index: 1,
            offset: 0x2000,
            size: 0x10,
            file_len: 0x2008
        }),
        "a segment reaching past the end of the file should be rejected"
    );

    let image = ElfImage::new(0x40_1000)
        .with(Phdr::load(0x40_1000, 0x1000, &[1; 0x80], 0x40, PF_R));
    assert!(matches!(
        parse_image(&image.bytes(), ps()),
        Err(ParseError::MemoryBelowFile { index: 0, .. })
    ));

    let image = ElfImage::new(0x40_1000)
        .with(Phdr::load(0x40_1000, 0x1000, &[1; 0x80], 0x80, PF_R | PF_X))
        .with(Phdr::load(0x40_1f00, 0x2000, &[2; 0x10], 0x10, PF_R | PF_W));
    assert_eq!(
        parse_image(&image.bytes(), ps()).err(),
        Some(ParseError::Overlap { first: 0, second: 1 }),
        "segments sharing a page should be rejected"
    );
}

#[test]
fn provider_reports_path() {
    let file = two_segments().write();
    let table = ElfProvider.parse(file.path()).unwrap();
    assert_eq!(table.segments().len(), 2);

    match ElfProvider.parse(std::path::Path::new("/nonexistent/lazyload-elf")) {
        Err(LoaderError::Open { path, .. }) => {
            assert_eq!(path, std::path::Path::new("/nonexistent/lazyload-elf"))
        }
        other => panic!("a missing file should be an open error, got {other:?}"),
    }

    let garbage = common::write_bytes(b"garbage");
    assert!(matches!(
        ElfProvider.parse(garbage.path()),
        Err(LoaderError::Parse {
            source: ParseError::NotElf(_),
            ..
        })
    ));
}
