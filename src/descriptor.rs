//! Board descriptors
//!
//! A board descriptor is a TOML document with one node per record kind:
//!
//! ```toml
//! [board]
//! name = "starfive-visionfive2"
//! category = "starfive"
//! url = "https://www.starfivetech.com/en/site/boards"
//!
//! [[flash]]
//! description = "SPL header"
//! compatible = "header"
//! size = 0x400
//!
//! [[flash]]
//! description = "bt0"
//! compatible = "bt0"
//! size = 0x10000
//! file = "starfive-visionfive2-bt0.bin"
//!
//! [[load]]
//! description = "main"
//! addr = 0x4000_0000
//! size = 0x20_0000
//!
//! [memory]
//! start = 0x4000_0000
//! size = 0x2_0000_0000
//! ```
//!
//! Flash areas are laid out in declaration order; the offset of every area is derived once while
//! validating and stored in the resulting [`BoardDescriptor`].

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, trace};
use serde::Deserialize;
use thiserror::Error;

/// Board descriptor validation errors
#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("Malformed board descriptor: {}", _0)]
    Malformed(String),
    #[error("Missing required field `{field}` in {node}")]
    MissingField { node: String, field: &'static str },
    #[error("Duplicate flash area {:?}", _0)]
    DuplicateArea(String),
    #[error("Load region {:?} overlaps load region {:?}", _0, _1)]
    OverlappingLoadRegion(String, String),
    #[error("Size of {} must be positive, got {}", _0, _1)]
    NonPositiveSize(String, i64),
    #[error("Flash area {name:?} declares offset {declared:#x}, but its position in the layout is {derived:#x}")]
    OffsetMismatch {
        name: String,
        declared: u64,
        derived: u64,
    },
    #[error("Flash area {:?} has size {:#x}, which is not a power of two", _0, _1)]
    Misaligned(String, u64),
    #[error("{} wraps around the address space", _0)]
    AddressOverflow(String),
    #[error("Could not read board descriptor {}: {}", .0.display(), .1)]
    Read(PathBuf, std::io::Error),
}

/// The compatibility tag of a flash area, selecting how its contents are interpreted
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AreaKind {
    /// Opaque region overwritten by the vendor header
    Header,
    /// First-stage boot program
    Bt0,
    /// Fixed device-tree blob
    Dtfs,
    /// Main payload
    Main,
    /// Reserved space, left as padding
    Reserved,
}

impl AreaKind {
    /// Returns true if the area holds flashable code or data and is subject to erase block
    /// granularity.
    pub fn is_flashable(self) -> bool {
        matches!(self, AreaKind::Bt0 | AreaKind::Dtfs | AreaKind::Main)
    }
}

impl fmt::Display for AreaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AreaKind::Header => "header",
            AreaKind::Bt0 => "bt0",
            AreaKind::Dtfs => "dtfs",
            AreaKind::Main => "main",
            AreaKind::Reserved => "reserved",
        };

        f.write_str(name)
    }
}

/// Identifying board metadata
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BoardInfo {
    pub name: String,
    pub category: String,
    pub url: Option<String>,
}

/// A region of the flash map
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FlashArea {
    /// Human readable label
    pub description: String,
    pub kind: AreaKind,
    /// Offset from the start of the image, derived from declaration order
    pub offset: u64,
    pub size: u64,
    /// Name of the artifact file that fills this area
    pub file: Option<String>,
}

impl FlashArea {
    /// Returns the offset one past the last byte of this area
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Where a later stage places a piece of content in memory
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LoadRegion {
    pub description: String,
    pub addr: u64,
    pub size: u64,
}

/// Physical memory of the board
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRange {
    pub start: u64,
    pub size: u64,
}

/// A validated board descriptor
///
/// Can only be obtained through parsing, so every instance upholds the layout invariants.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BoardDescriptor {
    board: BoardInfo,
    areas: Vec<FlashArea>,
    loads: Vec<LoadRegion>,
    memory: MemoryRange,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDescriptor {
    board: Option<RawBoard>,
    #[serde(default)]
    flash: Vec<RawFlashArea>,
    #[serde(default)]
    load: Vec<RawLoadRegion>,
    memory: Option<RawMemory>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBoard {
    name: Option<String>,
    category: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFlashArea {
    description: Option<String>,
    compatible: Option<AreaKind>,
    size: Option<i64>,
    offset: Option<i64>,
    file: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLoadRegion {
    description: Option<String>,
    addr: Option<i64>,
    size: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMemory {
    start: Option<i64>,
    size: Option<i64>,
}

fn required<T>(value: Option<T>, node: &str, field: &'static str) -> Result<T, DescriptorError> {
    value.ok_or_else(|| DescriptorError::MissingField {
        node: node.to_string(),
        field,
    })
}

fn positive(value: i64, what: &str) -> Result<u64, DescriptorError> {
    if value <= 0 {
        return Err(DescriptorError::NonPositiveSize(what.to_string(), value));
    }

    Ok(value as u64)
}

fn address(value: i64, what: &str) -> Result<u64, DescriptorError> {
    if value < 0 {
        return Err(DescriptorError::Malformed(format!(
            "{} has a negative address {}",
            what, value
        )));
    }

    Ok(value as u64)
}

impl BoardDescriptor {
    /// Reads and validates the board descriptor at `path`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<BoardDescriptor, DescriptorError> {
        let path = path.as_ref();

        debug!("Loading board descriptor {}", path.display());

        let text = fs::read_to_string(path)
            .map_err(|err| DescriptorError::Read(path.to_path_buf(), err))?;

        text.parse()
    }

    pub fn board(&self) -> &BoardInfo {
        &self.board
    }

    /// Flash areas in declaration order
    pub fn areas(&self) -> &[FlashArea] {
        &self.areas
    }

    /// Load regions in declaration order
    pub fn loads(&self) -> &[LoadRegion] {
        &self.loads
    }

    pub fn memory(&self) -> MemoryRange {
        self.memory
    }

    /// Returns the first flash area with the given `kind`
    pub fn area(&self, kind: AreaKind) -> Option<&FlashArea> {
        self.areas.iter().find(|area| area.kind == kind)
    }

    /// The total size of the flash map, which is also the size of a composed image
    pub fn flash_size(&self) -> u64 {
        self.areas.last().map(FlashArea::end).unwrap_or(0)
    }

    fn validate(raw: RawDescriptor) -> Result<BoardDescriptor, DescriptorError> {
        let raw_board = required(raw.board, "[board]", "board")?;
        let board = BoardInfo {
            name: required(raw_board.name, "[board]", "name")?,
            category: required(raw_board.category, "[board]", "category")?,
            url: raw_board.url,
        };

        let areas = Self::layout_areas(raw.flash)?;
        let loads = Self::check_loads(raw.load)?;

        let raw_memory = required(raw.memory, "[memory]", "memory")?;
        let start = address(required(raw_memory.start, "[memory]", "start")?, "[memory]")?;
        let size = positive(required(raw_memory.size, "[memory]", "size")?, "[memory]")?;

        if start.checked_add(size).is_none() {
            return Err(DescriptorError::AddressOverflow("[memory]".to_string()));
        }

        Ok(BoardDescriptor {
            board,
            areas,
            loads,
            memory: MemoryRange { start, size },
        })
    }

    /// Assigns every flash area its offset from the running sum of the sizes before it
    fn layout_areas(raw_areas: Vec<RawFlashArea>) -> Result<Vec<FlashArea>, DescriptorError> {
        let mut areas: Vec<FlashArea> = Vec::with_capacity(raw_areas.len());
        let mut descriptions = HashSet::new();
        let mut kinds = HashSet::new();
        let mut offset: u64 = 0;

        for (index, raw) in raw_areas.into_iter().enumerate() {
            let node = format!("[[flash]] #{}", index);
            let description = required(raw.description, &node, "description")?;
            let node = format!("flash area {:?}", description);
            let kind = required(raw.compatible, &node, "compatible")?;
            let size = positive(required(raw.size, &node, "size")?, &node)?;

            if !descriptions.insert(description.clone()) {
                return Err(DescriptorError::DuplicateArea(description));
            }

            if kind != AreaKind::Reserved && !kinds.insert(kind) {
                return Err(DescriptorError::DuplicateArea(format!(
                    "{} (compatible = {:?})",
                    description,
                    kind.to_string()
                )));
            }

            if kind.is_flashable() && !size.is_power_of_two() {
                return Err(DescriptorError::Misaligned(description, size));
            }

            if let Some(declared) = raw.offset {
                let declared = address(declared, &node)?;

                if declared != offset {
                    return Err(DescriptorError::OffsetMismatch {
                        name: description,
                        declared,
                        derived: offset,
                    });
                }
            }

            let end = offset
                .checked_add(size)
                .ok_or_else(|| DescriptorError::AddressOverflow(node.clone()))?;

            trace!(
                "Flash area {:?} ({}) at {:#x}..{:#x}",
                description,
                kind,
                offset,
                end
            );

            areas.push(FlashArea {
                description,
                kind,
                offset,
                size,
                file: raw.file,
            });

            offset = end;
        }

        Ok(areas)
    }

    /// Validates load regions, rejecting any pair that overlaps regardless of declaration order
    fn check_loads(raw_loads: Vec<RawLoadRegion>) -> Result<Vec<LoadRegion>, DescriptorError> {
        let mut loads = Vec::with_capacity(raw_loads.len());

        for (index, raw) in raw_loads.into_iter().enumerate() {
            let node = format!("[[load]] #{}", index);
            let description = required(raw.description, &node, "description")?;
            let node = format!("load region {:?}", description);
            let addr = address(required(raw.addr, &node, "addr")?, &node)?;
            let size = positive(required(raw.size, &node, "size")?, &node)?;

            if addr.checked_add(size).is_none() {
                return Err(DescriptorError::AddressOverflow(node));
            }

            loads.push(LoadRegion {
                description,
                addr,
                size,
            });
        }

        let mut sorted: Vec<&LoadRegion> = loads.iter().collect();
        sorted.sort_by_key(|region| region.addr);

        for pair in sorted.windows(2) {
            if pair[0].addr + pair[0].size > pair[1].addr {
                return Err(DescriptorError::OverlappingLoadRegion(
                    pair[0].description.clone(),
                    pair[1].description.clone(),
                ));
            }
        }

        Ok(loads)
    }
}

impl FromStr for BoardDescriptor {
    type Err = DescriptorError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let raw: RawDescriptor =
            toml::from_str(text).map_err(|err| DescriptorError::Malformed(err.to_string()))?;

        Self::validate(raw)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Descriptor for the reference layout used across the test suite
    pub(crate) const VISIONFIVE2: &str = r#"
        [board]
        name = "starfive-visionfive2"
        category = "starfive"
        url = "https://www.starfivetech.com/en/site/boards"

        [[flash]]
        description = "SPL header"
        compatible = "header"
        size = 0x400

        [[flash]]
        description = "bt0"
        compatible = "bt0"
        size = 0x10000
        file = "starfive-visionfive2-bt0.bin"

        [[flash]]
        description = "Fixed DTFS"
        compatible = "dtfs"
        size = 0x1000
        file = "starfive-visionfive2-board.dtb"

        [[flash]]
        description = "main"
        compatible = "main"
        size = 0x10000
        file = "starfive-visionfive2-main.bin"

        [[load]]
        description = "bt0"
        addr = 0x0800_0000
        size = 0x20000

        [[load]]
        description = "main"
        addr = 0x4000_0000
        size = 0x20_0000

        [memory]
        start = 0x4000_0000
        size = 0x2_0000_0000
    "#;

    fn with_loads(loads: &str) -> String {
        format!(
            r#"
            [board]
            name = "test"
            category = "test"

            [[flash]]
            description = "bt0"
            compatible = "bt0"
            size = 0x1000

            {}

            [memory]
            start = 0
            size = 0x1000_0000
            "#,
            loads
        )
    }

    #[test]
    fn it_should_derive_offsets_from_declaration_order() {
        let descriptor: BoardDescriptor = VISIONFIVE2.parse().unwrap();
        let offsets: Vec<u64> = descriptor.areas().iter().map(|a| a.offset).collect();

        assert_eq!(offsets, vec![0, 0x400, 0x10400, 0x11400]);
        assert_eq!(descriptor.flash_size(), 0x21400);
        assert_eq!(descriptor.board().name, "starfive-visionfive2");
        assert_eq!(descriptor.area(AreaKind::Dtfs).unwrap().size, 0x1000);
        assert_eq!(descriptor.memory().start, 0x4000_0000);
    }

    #[test]
    fn it_should_reject_missing_area_size() {
        let text = VISIONFIVE2.replacen("size = 0x1000\n", "\n", 1);

        match text.parse::<BoardDescriptor>() {
            Err(DescriptorError::MissingField { field, node }) => {
                assert_eq!(field, "size");
                assert!(node.contains("Fixed DTFS"));
            }
            other => panic!("expected missing field, got {:?}", other),
        }
    }

    #[test]
    fn it_should_reject_unknown_fields() {
        let text = VISIONFIVE2.replacen("size = 0x400", "size = 0x400\nalign = 4", 1);

        assert!(matches!(
            text.parse::<BoardDescriptor>(),
            Err(DescriptorError::Malformed(_))
        ));
    }

    #[test]
    fn it_should_reject_malformed_syntax() {
        assert!(matches!(
            "[board\nname = 1".parse::<BoardDescriptor>(),
            Err(DescriptorError::Malformed(_))
        ));
    }

    #[test]
    fn it_should_reject_duplicate_areas() {
        let text = VISIONFIVE2.replace("description = \"Fixed DTFS\"", "description = \"bt0\"");

        assert!(matches!(
            text.parse::<BoardDescriptor>(),
            Err(DescriptorError::DuplicateArea(name)) if name == "bt0"
        ));
    }

    #[test]
    fn it_should_reject_duplicate_tags() {
        let text = VISIONFIVE2.replace("compatible = \"dtfs\"", "compatible = \"bt0\"");

        assert!(matches!(
            text.parse::<BoardDescriptor>(),
            Err(DescriptorError::DuplicateArea(_))
        ));
    }

    #[test]
    fn it_should_reject_non_positive_sizes() {
        let text = VISIONFIVE2.replacen("size = 0x400", "size = 0", 1);

        assert!(matches!(
            text.parse::<BoardDescriptor>(),
            Err(DescriptorError::NonPositiveSize(_, 0))
        ));

        let text = VISIONFIVE2.replacen("size = 0x400", "size = -1024", 1);

        assert!(matches!(
            text.parse::<BoardDescriptor>(),
            Err(DescriptorError::NonPositiveSize(_, -1024))
        ));
    }

    #[test]
    fn it_should_reject_flashable_areas_that_are_not_a_power_of_two() {
        let text = VISIONFIVE2.replacen("size = 0x1000\n", "size = 0x1800\n", 1);

        assert!(matches!(
            text.parse::<BoardDescriptor>(),
            Err(DescriptorError::Misaligned(_, 0x1800))
        ));
    }

    #[test]
    fn it_should_accept_matching_explicit_offsets() {
        let text = VISIONFIVE2.replacen(
            "compatible = \"bt0\"",
            "compatible = \"bt0\"\noffset = 0x400",
            1,
        );
        let descriptor: BoardDescriptor = text.parse().unwrap();

        assert_eq!(descriptor.area(AreaKind::Bt0).unwrap().offset, 0x400);
    }

    #[test]
    fn it_should_reject_conflicting_explicit_offsets() {
        let text = VISIONFIVE2.replacen(
            "compatible = \"bt0\"",
            "compatible = \"bt0\"\noffset = 0x1000",
            1,
        );

        match text.parse::<BoardDescriptor>() {
            Err(DescriptorError::OffsetMismatch {
                declared, derived, ..
            }) => {
                assert_eq!(declared, 0x1000);
                assert_eq!(derived, 0x400);
            }
            other => panic!("expected offset mismatch, got {:?}", other),
        }
    }

    #[test]
    fn it_should_reject_overlapping_load_regions_in_any_order() {
        let a = "[[load]]\ndescription = \"a\"\naddr = 0x1000\nsize = 0x1000\n";
        let b = "[[load]]\ndescription = \"b\"\naddr = 0x1800\nsize = 0x100\n";

        for loads in &[format!("{}\n{}", a, b), format!("{}\n{}", b, a)] {
            assert!(matches!(
                with_loads(loads).parse::<BoardDescriptor>(),
                Err(DescriptorError::OverlappingLoadRegion(_, _))
            ));
        }
    }

    #[test]
    fn it_should_accept_adjacent_load_regions() {
        let loads = "[[load]]\ndescription = \"a\"\naddr = 0x1000\nsize = 0x1000\n\n\
                     [[load]]\ndescription = \"b\"\naddr = 0x2000\nsize = 0x1000\n";
        let descriptor: BoardDescriptor = with_loads(loads).parse().unwrap();

        assert_eq!(descriptor.loads().len(), 2);
        assert_eq!(descriptor.loads()[1].description, "b");
    }

    #[test]
    fn it_should_load_descriptor_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.toml");
        fs::write(&path, VISIONFIVE2).unwrap();

        let descriptor = BoardDescriptor::load(&path).unwrap();

        assert_eq!(descriptor.areas().len(), 4);
        assert!(matches!(
            BoardDescriptor::load(dir.path().join("missing.toml")),
            Err(DescriptorError::Read(_, _))
        ));
    }
}
