use std::io::Write;

use similar_asserts::assert_eq;
use tempfile::NamedTempFile;

use vambrace_macho::{MachoArchive, MachoBinary};
use vambrace_objc::{ObjcClassLike, ObjcRuntimeData};
use vambrace_testutils::{BindStreamBuilder, ImageBuilder, RebaseStreamBuilder, VIRTUAL_BASE};

const S_SYMBOL_STUBS: u32 = 0x8000_0408;

const FOUNDATION: &str = "/System/Library/Frameworks/Foundation.framework/Foundation";
const UIKIT: &str = "/System/Library/Frameworks/UIKit.framework/UIKit";
const LIBOBJC: &str = "/usr/lib/libobjc.A.dylib";
const LIBSYSTEM: &str = "/usr/lib/libSystem.B.dylib";

/// Builds an image with one class (`AamvaPDF417`, conforming to
/// `NSURLSessionDelegate`), one category (`DataController` on an imported
/// `NSURLRequest`), selector/class reference tables, stubs and imports.
fn runtime_fixture() -> Vec<u8> {
    let mut b = ImageBuilder::new();
    b.section("__TEXT", "__text", VIRTUAL_BASE + 0x4000, 0x1800)
        .section_with("__TEXT", "__stubs", VIRTUAL_BASE + 0x5800, 0x24, S_SYMBOL_STUBS, 0, 12)
        .section("__TEXT", "__objc_methname", VIRTUAL_BASE + 0x6000, 0x200)
        .section("__TEXT", "__cstring", VIRTUAL_BASE + 0x6200, 0x200)
        .section("__DATA", "__objc_selrefs", VIRTUAL_BASE + 0x7000, 0x40)
        .section("__DATA", "__objc_classrefs", VIRTUAL_BASE + 0x7040, 0x20)
        .section("__DATA", "__objc_classlist", VIRTUAL_BASE + 0x7060, 0x8)
        .section("__DATA", "__objc_catlist", VIRTUAL_BASE + 0x7070, 0x8)
        .section("__DATA", "__objc_protolist", VIRTUAL_BASE + 0x7080, 0x8)
        .section("__DATA", "__objc_const", VIRTUAL_BASE + 0x7100, 0x800)
        .section("__DATA", "__objc_data", VIRTUAL_BASE + 0x7900, 0x100);

    let foundation = b.add_dylib(FOUNDATION, 0x4cc_fe80);
    let uikit = b.add_dylib(UIKIT, 0x0f1_0000);
    let libobjc = b.add_dylib(LIBOBJC, 0x1c8_0000);
    let libsystem = b.add_dylib(LIBSYSTEM, 0x501_0000);

    b.add_exported_symbol("_main", VIRTUAL_BASE + 0x4000);
    let nslog = b.add_undefined_symbol("_NSLog", foundation);
    b.add_undefined_symbol("_NSStringFromClass", foundation);
    let uiappmain = b.add_undefined_symbol("_UIApplicationMain", uikit);
    let msgsend = b.add_undefined_symbol("_objc_msgSend", libobjc);
    b.add_undefined_symbol("_objc_msgSendSuper2", libobjc);
    b.add_undefined_symbol("_rand", libsystem);
    b.add_undefined_symbol("_OBJC_CLASS_$_NSObject", libobjc);
    b.add_undefined_symbol("_OBJC_CLASS_$_NSURLRequest", foundation);
    b.add_undefined_symbol("_OBJC_CLASS_$_UIFont", uikit);

    // __stubs slots, in indirect-table order
    b.indirect_symbols(vec![nslog, msgsend, uiappmain]);

    // selector name strings
    b.write_str_at(VIRTUAL_BASE + 0x6000, "viewDidLoad");
    b.write_str_at(VIRTUAL_BASE + 0x6010, "allowsAnyHTTPSCertificateForHost:");
    b.write_str_at(VIRTUAL_BASE + 0x6040, "URLSession:didBecomeInvalidWithError:");
    b.write_str_at(
        VIRTUAL_BASE + 0x6070,
        "URLSession:didReceiveChallenge:completionHandler:",
    );
    b.write_str_at(
        VIRTUAL_BASE + 0x60b0,
        "URLSessionDidFinishEventsForBackgroundURLSession:",
    );

    // class, category, protocol, ivar strings
    b.write_str_at(VIRTUAL_BASE + 0x6200, "AamvaPDF417");
    b.write_str_at(VIRTUAL_BASE + 0x6210, "DataController");
    b.write_str_at(VIRTUAL_BASE + 0x6220, "NSURLSessionDelegate");
    b.write_str_at(VIRTUAL_BASE + 0x6240, "_fields");
    b.write_str_at(VIRTUAL_BASE + 0x6250, "@\"NSMutableDictionary\"");
    b.write_str_at(VIRTUAL_BASE + 0x6270, "source");
    b.write_str_at(VIRTUAL_BASE + 0x6280, "@\"NSString\"");
    b.write_str_at(VIRTUAL_BASE + 0x6290, "data_element_separator");
    b.write_str_at(VIRTUAL_BASE + 0x62b0, "S");
    b.write_str_at(VIRTUAL_BASE + 0x62b8, "number_of_entries");
    b.write_str_at(VIRTUAL_BASE + 0x62d0, "i");
    b.write_str_at(VIRTUAL_BASE + 0x62d8, "v16@0:8");

    // class_ro_t for AamvaPDF417
    b.write_u32_at(VIRTUAL_BASE + 0x7100, 0) // flags
        .write_u32_at(VIRTUAL_BASE + 0x7104, 8) // instance start
        .write_u32_at(VIRTUAL_BASE + 0x7108, 96) // instance size
        .write_u64_at(VIRTUAL_BASE + 0x7118, VIRTUAL_BASE + 0x6200) // name
        .write_u64_at(VIRTUAL_BASE + 0x7120, VIRTUAL_BASE + 0x7200) // methods
        .write_u64_at(VIRTUAL_BASE + 0x7128, VIRTUAL_BASE + 0x7280) // protocols
        .write_u64_at(VIRTUAL_BASE + 0x7130, VIRTUAL_BASE + 0x7300); // ivars

    // instance-method list: viewDidLoad at 0x100004100
    b.write_u32_at(VIRTUAL_BASE + 0x7200, 24)
        .write_u32_at(VIRTUAL_BASE + 0x7204, 1)
        .write_u64_at(VIRTUAL_BASE + 0x7208, VIRTUAL_BASE + 0x6000)
        .write_u64_at(VIRTUAL_BASE + 0x7210, VIRTUAL_BASE + 0x62d8)
        .write_u64_at(VIRTUAL_BASE + 0x7218, VIRTUAL_BASE + 0x4100);

    // adopted-protocol list: one local protocol
    b.write_u64_at(VIRTUAL_BASE + 0x7280, 1)
        .write_u64_at(VIRTUAL_BASE + 0x7288, VIRTUAL_BASE + 0x7400);

    // ivar list: four ivars at documented offsets
    b.write_u32_at(VIRTUAL_BASE + 0x7300, 32)
        .write_u32_at(VIRTUAL_BASE + 0x7304, 4);
    let ivars: [(u64, u64, u64, u32, u32); 4] = [
        (VIRTUAL_BASE + 0x79a0, VIRTUAL_BASE + 0x6240, VIRTUAL_BASE + 0x6250, 3, 8),
        (VIRTUAL_BASE + 0x79a8, VIRTUAL_BASE + 0x6270, VIRTUAL_BASE + 0x6280, 3, 8),
        (VIRTUAL_BASE + 0x79b0, VIRTUAL_BASE + 0x6290, VIRTUAL_BASE + 0x62b0, 1, 2),
        (VIRTUAL_BASE + 0x79b8, VIRTUAL_BASE + 0x62b8, VIRTUAL_BASE + 0x62d0, 2, 4),
    ];
    for (index, (offset_ptr, name, encoding, align, size)) in ivars.iter().enumerate() {
        let entry = VIRTUAL_BASE + 0x7308 + index as u64 * 32;
        b.write_u64_at(entry, *offset_ptr)
            .write_u64_at(entry + 8, *name)
            .write_u64_at(entry + 16, *encoding)
            .write_u32_at(entry + 24, *align)
            .write_u32_at(entry + 28, *size);
    }
    // the ivar offset variables the offset pointers target
    b.write_u32_at(VIRTUAL_BASE + 0x79a0, 8)
        .write_u32_at(VIRTUAL_BASE + 0x79a8, 32)
        .write_u32_at(VIRTUAL_BASE + 0x79b0, 40)
        .write_u32_at(VIRTUAL_BASE + 0x79b8, 56);

    // protocol_t NSURLSessionDelegate with three optional methods
    b.write_u64_at(VIRTUAL_BASE + 0x7408, VIRTUAL_BASE + 0x6220) // name
        .write_u64_at(VIRTUAL_BASE + 0x7428, VIRTUAL_BASE + 0x7450); // optional methods
    b.write_u32_at(VIRTUAL_BASE + 0x7450, 24)
        .write_u32_at(VIRTUAL_BASE + 0x7454, 3);
    for (index, name) in [0x6040u64, 0x6070, 0x60b0].iter().enumerate() {
        let entry = VIRTUAL_BASE + 0x7458 + index as u64 * 24;
        b.write_u64_at(entry, VIRTUAL_BASE + name)
            .write_u64_at(entry + 8, VIRTUAL_BASE + 0x62d8)
            .write_u64_at(entry + 16, 0);
    }

    // category_t DataController; its base class binds to NSURLRequest
    b.write_u64_at(VIRTUAL_BASE + 0x7500, VIRTUAL_BASE + 0x6210) // name
        .write_u64_at(VIRTUAL_BASE + 0x7510, VIRTUAL_BASE + 0x7550); // methods
    b.write_u32_at(VIRTUAL_BASE + 0x7550, 24)
        .write_u32_at(VIRTUAL_BASE + 0x7554, 1)
        .write_u64_at(VIRTUAL_BASE + 0x7558, VIRTUAL_BASE + 0x6010)
        .write_u64_at(VIRTUAL_BASE + 0x7560, VIRTUAL_BASE + 0x62d8)
        .write_u64_at(VIRTUAL_BASE + 0x7568, VIRTUAL_BASE + 0x5028);

    // class_t AamvaPDF417; superclass binds to NSObject
    b.write_u64_at(VIRTUAL_BASE + 0x7920, VIRTUAL_BASE + 0x7100); // data

    // list sections
    b.write_u64_at(VIRTUAL_BASE + 0x7060, VIRTUAL_BASE + 0x7900); // classlist
    b.write_u64_at(VIRTUAL_BASE + 0x7070, VIRTUAL_BASE + 0x7500); // catlist
    b.write_u64_at(VIRTUAL_BASE + 0x7080, VIRTUAL_BASE + 0x7400); // protolist

    // selrefs and classrefs
    b.write_u64_at(VIRTUAL_BASE + 0x7000, VIRTUAL_BASE + 0x6010);
    b.write_u64_at(VIRTUAL_BASE + 0x7008, VIRTUAL_BASE + 0x6000);
    b.write_u64_at(VIRTUAL_BASE + 0x7048, VIRTUAL_BASE + 0x7900);

    let data = b.segment_index("__DATA");
    b.bind_stream(
        BindStreamBuilder::new()
            .set_dylib_ordinal(libobjc)
            .set_symbol("_OBJC_CLASS_$_NSObject")
            .set_type_pointer()
            .set_segment_offset(data, 0x908)
            .do_bind()
            .set_dylib_ordinal(foundation)
            .set_symbol("_OBJC_CLASS_$_NSURLRequest")
            .set_segment_offset(data, 0x508)
            .do_bind()
            .set_dylib_ordinal(uikit)
            .set_symbol("_OBJC_CLASS_$_UIFont")
            .set_segment_offset(data, 0x40)
            .do_bind()
            .done(),
    );
    b.rebase_stream(
        RebaseStreamBuilder::new()
            .set_type_pointer()
            .set_segment_offset(data, 0x60)
            .do_rebase(1)
            .done(),
    );

    b.build()
}

fn parse_fixture() -> (NamedTempFile, MachoBinary) {
    let image = runtime_fixture();
    let mut tmp = NamedTempFile::new().unwrap();
    tmp.write_all(&image).unwrap();
    tmp.flush().unwrap();
    let binary = MachoArchive::open(tmp.path())
        .unwrap()
        .get_arm64_slice()
        .unwrap();
    (tmp, binary)
}

#[test]
fn test_path_for_external_symbol() {
    let (_tmp, binary) = parse_fixture();
    let objc = ObjcRuntimeData::parse(&binary);

    let correct_map = [
        ("_NSLog", FOUNDATION),
        ("_NSStringFromClass", FOUNDATION),
        ("_UIApplicationMain", UIKIT),
        ("_objc_msgSend", LIBOBJC),
        ("_objc_msgSendSuper2", LIBOBJC),
        ("_rand", LIBSYSTEM),
        ("_OBJC_CLASS_$_NSObject", LIBOBJC),
        ("_OBJC_CLASS_$_NSURLRequest", FOUNDATION),
        ("_OBJC_CLASS_$_UIFont", UIKIT),
    ];
    for (symbol, path) in correct_map {
        assert_eq!(objc.path_for_external_symbol(symbol), Some(path), "{symbol}");
    }
    assert_eq!(objc.path_for_external_symbol("XXX_fake_symbol_XXX"), None);
}

#[test]
fn test_parse_class_with_ivars() {
    let (_tmp, binary) = parse_fixture();
    let objc = ObjcRuntimeData::parse(&binary);

    let class = objc
        .classes()
        .iter()
        .find_map(|c| match c {
            ObjcClassLike::Class(class) if class.name == "AamvaPDF417" => Some(class),
            _ => None,
        })
        .expect("AamvaPDF417 not parsed");

    assert_eq!(class.superclass_name.as_deref(), Some("NSObject"));
    assert!(!class.is_metaclass);

    let mut parsed: Vec<(String, String, u64)> = class
        .ivars
        .iter()
        .map(|ivar| (ivar.name.clone(), ivar.type_encoding.clone(), ivar.field_offset))
        .collect();
    parsed.sort();
    let mut correct = vec![
        ("_fields".to_owned(), "@\"NSMutableDictionary\"".to_owned(), 8),
        ("source".to_owned(), "@\"NSString\"".to_owned(), 32),
        ("data_element_separator".to_owned(), "S".to_owned(), 40),
        ("number_of_entries".to_owned(), "i".to_owned(), 56),
    ];
    correct.sort();
    assert_eq!(parsed, correct);

    assert_eq!(class.selectors.len(), 1);
    assert_eq!(class.selectors[0].name, "viewDidLoad");
    assert_eq!(class.selectors[0].implementation, Some(VIRTUAL_BASE + 0x4100));
}

#[test]
fn test_find_categories() {
    let (_tmp, binary) = parse_fixture();
    let objc = ObjcRuntimeData::parse(&binary);

    let categories: Vec<_> = objc
        .classes()
        .iter()
        .filter_map(|c| match c {
            ObjcClassLike::Category(category) => Some(category),
            _ => None,
        })
        .collect();
    assert_eq!(categories.len(), 1);

    let category = categories[0];
    assert_eq!(category.name, "DataController");
    assert_eq!(category.base_class, "NSURLRequest");
    assert_eq!(category.selectors.len(), 1);
    assert_eq!(category.selectors[0].name, "allowsAnyHTTPSCertificateForHost:");
    assert_eq!(category.selectors[0].implementation, Some(VIRTUAL_BASE + 0x5028));
}

#[test]
fn test_category_selectors_live_in_executable_sections() {
    let (_tmp, binary) = parse_fixture();
    let objc = ObjcRuntimeData::parse(&binary);

    let text = binary.section_named("__text").unwrap();
    for class in objc.classes() {
        if let ObjcClassLike::Category(category) = class {
            for selector in &category.selectors {
                let imp = selector.implementation.expect("category method without imp");
                assert!(text.contains(imp), "{} outside __text", selector.name);
            }
        }
    }
}

#[test]
fn test_find_protocols() {
    let (_tmp, binary) = parse_fixture();
    let objc = ObjcRuntimeData::parse(&binary);

    let protocols = objc.protocols();
    assert_eq!(protocols.len(), 1);

    let session = &protocols[0];
    assert_eq!(session.name, "NSURLSessionDelegate");

    let mut selector_names: Vec<&str> =
        session.selectors.iter().map(|s| s.name.as_str()).collect();
    selector_names.sort();
    assert_eq!(
        selector_names,
        vec![
            "URLSession:didBecomeInvalidWithError:",
            "URLSession:didReceiveChallenge:completionHandler:",
            "URLSessionDidFinishEventsForBackgroundURLSession:",
        ]
    );
    // protocol declarations carry no implementations
    assert!(session.selectors.iter().all(|s| s.implementation.is_none()));
}

#[test]
fn test_class_conformed_protocols() {
    let (_tmp, binary) = parse_fixture();
    let objc = ObjcRuntimeData::parse(&binary);

    let class = objc
        .classes()
        .iter()
        .find(|c| c.name() == "AamvaPDF417")
        .unwrap();
    let names: Vec<&str> = class.protocols().iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["NSURLSessionDelegate"]);
}

#[test]
fn test_selector_reference_map() {
    let (_tmp, binary) = parse_fixture();
    let objc = ObjcRuntimeData::parse(&binary);

    let selector = objc.selector_for_selref(VIRTUAL_BASE + 0x7000).unwrap();
    assert_eq!(selector.name, "allowsAnyHTTPSCertificateForHost:");
    assert_eq!(selector.implementation, Some(VIRTUAL_BASE + 0x5028));

    let viewdidload = objc.selector_for_selref(VIRTUAL_BASE + 0x7008).unwrap();
    assert_eq!(viewdidload.name, "viewDidLoad");

    assert_eq!(
        objc.selref_for_selector_name("viewDidLoad"),
        Some(VIRTUAL_BASE + 0x7008)
    );
    assert_eq!(objc.selector_for_selref(0xdead_beef), None);
}

#[test]
fn test_class_reference_map() {
    let (_tmp, binary) = parse_fixture();
    let objc = ObjcRuntimeData::parse(&binary);

    // bound entry resolves to the stripped imported class name
    assert_eq!(
        objc.class_name_for_classref(VIRTUAL_BASE + 0x7040),
        Some("UIFont")
    );
    // local entry resolves through the class structure
    assert_eq!(
        objc.class_name_for_classref(VIRTUAL_BASE + 0x7048),
        Some("AamvaPDF417")
    );
}

#[test]
fn test_imported_symbol_stub_map() {
    let (_tmp, binary) = parse_fixture();
    let objc = ObjcRuntimeData::parse(&binary);

    let stubs = objc.imported_symbol_names_to_pointers();
    assert_eq!(stubs.len(), 3);
    assert_eq!(stubs["_NSLog"], VIRTUAL_BASE + 0x5800);
    assert_eq!(stubs["_objc_msgSend"], VIRTUAL_BASE + 0x580c);
    assert_eq!(stubs["_UIApplicationMain"], VIRTUAL_BASE + 0x5818);

    // every stub lies within __stubs
    let section = binary.section_named("__stubs").unwrap();
    for (symbol, stub) in stubs {
        assert!(section.contains(*stub), "{symbol} stub outside __stubs");
        assert_eq!(objc.symbol_for_stub(*stub), Some(symbol.as_str()));
    }
}

#[test]
fn test_dyld_fixups() {
    let (_tmp, binary) = parse_fixture();
    let objc = ObjcRuntimeData::parse(&binary);
    let dyld = objc.dyld_info();

    assert_eq!(
        dyld.bound_symbol_at(VIRTUAL_BASE + 0x7908),
        Some("_OBJC_CLASS_$_NSObject")
    );
    assert_eq!(
        dyld.bound_symbol_at(VIRTUAL_BASE + 0x7508),
        Some("_OBJC_CLASS_$_NSURLRequest")
    );
    // the classlist entry is rebased; its target is the stored pointer
    assert_eq!(
        dyld.rebase_target_at(VIRTUAL_BASE + 0x7060),
        Some(VIRTUAL_BASE + 0x7900)
    );
    assert_eq!(dyld.fixup_at(VIRTUAL_BASE + 0x9999), None);
}

#[test]
fn test_method_enumeration() {
    let (_tmp, binary) = parse_fixture();
    let objc = ObjcRuntimeData::parse(&binary);

    let methods = objc.methods();
    assert_eq!(methods.len(), 2);

    let class_method = methods
        .iter()
        .find(|m| m.class_name == "AamvaPDF417")
        .unwrap();
    assert_eq!(class_method.category_base_class, None);
    assert_eq!(class_method.selector.name, "viewDidLoad");

    let category_method = methods
        .iter()
        .find(|m| m.class_name == "DataController")
        .unwrap();
    assert_eq!(
        category_method.category_base_class.as_deref(),
        Some("NSURLRequest")
    );
    assert_eq!(
        category_method.selector.implementation,
        Some(VIRTUAL_BASE + 0x5028)
    );
}
