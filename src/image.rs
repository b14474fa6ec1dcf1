//! Flash image composition
//!
//! Lays independently built artifacts out at the offsets a [`BoardDescriptor`] declares.

use std::collections::HashMap;
use std::convert::TryFrom;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use log::{debug, info, trace};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::descriptor::{AreaKind, BoardDescriptor, FlashArea};

/// The offset at which the main binary is appended when it's carried along with bt0
pub const PAYLOAD_OFFSET: usize = 0x8000;

#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("Artifact for flash area {area:?} is {len} bytes, but the area only holds {size}")]
    ArtifactTooLarge { area: String, len: usize, size: u64 },
    #[error("No artifact was supplied for flash area {:?} (file {:?})", _0, _1)]
    MissingArtifact(String, String),
    #[error("Could not read artifact {}: {}", .0.display(), .1)]
    ArtifactRead(PathBuf, std::io::Error),
    #[error("Primary image is {} bytes, which exceeds the payload offset {:#x}", _0, _1)]
    PrimaryExceedsBoundary(usize, usize),
    #[error("The flash map is too large to be composed in memory ({:#x} bytes)", _0)]
    ImageTooLarge(u64),
    #[error("Could not write image {}: {}", .0.display(), .1)]
    Write(PathBuf, std::io::Error),
}

/// Built binary artifacts
///
/// An artifact is registered either for one flash area by its description, or for every area with
/// a compatibility tag. The area specific one wins when both exist.
#[derive(Debug, Default, Clone)]
pub struct Artifacts {
    by_kind: HashMap<AreaKind, Vec<u8>>,
    by_area: HashMap<String, Vec<u8>>,
}

impl Artifacts {
    pub fn new() -> Artifacts {
        Artifacts::default()
    }

    /// Adds the artifact `bytes` for areas tagged with `kind`, replacing any previous one
    pub fn insert(&mut self, kind: AreaKind, bytes: Vec<u8>) -> &mut Artifacts {
        self.by_kind.insert(kind, bytes);
        self
    }

    /// Adds the artifact `bytes` for the single area named `description`
    pub fn insert_for_area<S: Into<String>>(
        &mut self,
        description: S,
        bytes: Vec<u8>,
    ) -> &mut Artifacts {
        self.by_area.insert(description.into(), bytes);
        self
    }

    pub fn get(&self, kind: AreaKind) -> Option<&[u8]> {
        self.by_kind.get(&kind).map(Vec::as_slice)
    }

    /// Returns the artifact that fills `area`
    pub fn for_area(&self, area: &FlashArea) -> Option<&[u8]> {
        self.by_area
            .get(&area.description)
            .map(Vec::as_slice)
            .or_else(|| self.get(area.kind))
    }

    /// Reads the file referenced by every flash area of `descriptor` from `dir`
    pub fn from_dir<P: AsRef<Path>>(
        dir: P,
        descriptor: &BoardDescriptor,
    ) -> Result<Artifacts, ComposeError> {
        let mut artifacts = Artifacts::new();

        for area in descriptor.areas() {
            if let Some(file) = &area.file {
                let path = dir.as_ref().join(file);

                debug!("Reading artifact {} for {:?}", path.display(), area.description);

                let bytes = fs::read(&path).map_err(|err| ComposeError::ArtifactRead(path, err))?;
                artifacts.insert_for_area(area.description.as_str(), bytes);
            }
        }

        Ok(artifacts)
    }
}

/// Records which flash area occupies which byte range of a composed image
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Placement {
    pub description: String,
    pub kind: AreaKind,
    pub range: Range<usize>,
    /// Number of artifact bytes copied into the area, if any
    pub artifact_len: Option<usize>,
}

/// A complete flash image together with its layout
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ComposedImage {
    bytes: Vec<u8>,
    placements: Vec<Placement>,
}

impl ComposedImage {
    /// Composes the image described by `descriptor` from `artifacts`
    ///
    /// Areas without a file reference are zero filled. Fails without producing any image if an
    /// artifact doesn't fit its area.
    pub fn compose(
        descriptor: &BoardDescriptor,
        artifacts: &Artifacts,
    ) -> Result<ComposedImage, ComposeError> {
        let flash_size = descriptor.flash_size();
        let total =
            usize::try_from(flash_size).map_err(|_| ComposeError::ImageTooLarge(flash_size))?;

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(total)
            .map_err(|_| ComposeError::ImageTooLarge(flash_size))?;
        bytes.resize(total, 0);

        let mut placements = Vec::with_capacity(descriptor.areas().len());

        for area in descriptor.areas() {
            let range = area_range(area);
            let artifact_len = match &area.file {
                Some(file) => {
                    let artifact = artifacts.for_area(area).ok_or_else(|| {
                        ComposeError::MissingArtifact(area.description.clone(), file.clone())
                    })?;

                    if artifact.len() > range.len() {
                        return Err(ComposeError::ArtifactTooLarge {
                            area: area.description.clone(),
                            len: artifact.len(),
                            size: area.size,
                        });
                    }

                    bytes[range.start..range.start + artifact.len()].copy_from_slice(artifact);

                    Some(artifact.len())
                }
                None => None,
            };

            trace!(
                "Placed {:?} at {:#x}..{:#x} ({:?} bytes of artifact)",
                area.description,
                range.start,
                range.end,
                artifact_len
            );

            placements.push(Placement {
                description: area.description.clone(),
                kind: area.kind,
                range,
                artifact_len,
            });
        }

        info!(
            "Composed {} image of {:#x} bytes",
            descriptor.board().name,
            bytes.len()
        );

        Ok(ComposedImage { bytes, placements })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// Returns the placement of the first area tagged with `kind`
    pub fn placement(&self, kind: AreaKind) -> Option<&Placement> {
        self.placements.iter().find(|p| p.kind == kind)
    }

    /// SHA-256 digest of the whole image as a lowercase hex string
    pub fn sha256(&self) -> String {
        format!("{:x}", Sha256::digest(&self.bytes))
    }

    /// Writes the image to `path`
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ComposeError> {
        let path = path.as_ref();

        fs::write(path, &self.bytes).map_err(|err| ComposeError::Write(path.to_path_buf(), err))
    }
}

fn area_range(area: &FlashArea) -> Range<usize> {
    // Offsets and sizes fit in usize once the total flash size does
    area.offset as usize..area.end() as usize
}

/// Pads `primary` to `offset` with zeroes and appends `payload` right after it
///
/// This is how bt0 carries the main binary when the two are loaded together over the serial link.
pub fn with_payload(primary: &[u8], offset: usize, payload: &[u8]) -> Result<Vec<u8>, ComposeError> {
    if primary.len() > offset {
        return Err(ComposeError::PrimaryExceedsBoundary(primary.len(), offset));
    }

    let mut image = Vec::with_capacity(offset + payload.len());
    image.extend_from_slice(primary);
    image.resize(offset, 0);
    image.extend_from_slice(payload);

    debug!(
        "Appended {} byte payload at {:#x} after {} byte primary image",
        payload.len(),
        offset,
        primary.len()
    );

    Ok(image)
}

/// File names of the artifacts built for a board
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ArtifactNames {
    board: String,
}

impl ArtifactNames {
    pub fn for_board<S: Into<String>>(board: S) -> ArtifactNames {
        ArtifactNames {
            board: board.into(),
        }
    }

    pub fn bt0(&self) -> String {
        format!("{}-bt0.bin", self.board)
    }

    pub fn dtb(&self) -> String {
        format!("{}-board.dtb", self.board)
    }

    pub fn main(&self) -> String {
        format!("{}-main.bin", self.board)
    }

    /// The composed flash image
    pub fn all(&self) -> String {
        format!("{}-all.bin", self.board)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::VISIONFIVE2;

    fn visionfive2() -> BoardDescriptor {
        VISIONFIVE2.parse().unwrap()
    }

    fn artifacts() -> Artifacts {
        let mut artifacts = Artifacts::new();
        artifacts
            .insert(AreaKind::Bt0, vec![0xb0; 0x1234])
            .insert(AreaKind::Dtfs, vec![0xd7; 0x800])
            .insert(AreaKind::Main, vec![0x4d; 0x10000]);
        artifacts
    }

    #[test]
    fn it_should_compose_reference_layout() {
        let descriptor = visionfive2();
        let image = ComposedImage::compose(&descriptor, &artifacts()).unwrap();
        let bytes = image.as_bytes();

        assert_eq!(image.len(), 0x400 + 0x10000 + 0x1000 + 0x10000);
        assert_eq!(image.len() as u64, descriptor.flash_size());

        // Header placeholder is zeroed
        assert!(bytes[..0x400].iter().all(|&b| b == 0));
        // bt0 starts right after the header and is zero padded
        assert_eq!(&bytes[0x400..0x400 + 0x1234], &[0xb0; 0x1234][..]);
        assert!(bytes[0x400 + 0x1234..0x10400].iter().all(|&b| b == 0));
        assert_eq!(bytes[0x10400], 0xd7);
        assert_eq!(bytes[0x11400], 0x4d);
        assert_eq!(bytes[0x21400 - 1], 0x4d);
    }

    #[test]
    fn it_should_record_placements() {
        let image = ComposedImage::compose(&visionfive2(), &artifacts()).unwrap();
        let bt0 = image.placement(AreaKind::Bt0).unwrap();

        assert_eq!(bt0.range, 0x400..0x10400);
        assert_eq!(bt0.artifact_len, Some(0x1234));
        assert_eq!(image.placement(AreaKind::Header).unwrap().artifact_len, None);
        assert_eq!(image.placements().len(), 4);
    }

    #[test]
    fn it_should_match_flash_size_for_every_layout() {
        let text = VISIONFIVE2.replace("size = 0x10000\n", "size = 0x8000\n");
        let descriptor: BoardDescriptor = text.parse().unwrap();
        let mut artifacts = Artifacts::new();
        artifacts
            .insert(AreaKind::Bt0, vec![1; 16])
            .insert(AreaKind::Dtfs, vec![2; 16])
            .insert(AreaKind::Main, vec![3; 16]);

        let image = ComposedImage::compose(&descriptor, &artifacts).unwrap();
        let sum: u64 = descriptor.areas().iter().map(|a| a.size).sum();

        assert_eq!(image.len() as u64, sum);
        assert_eq!(image.len(), 0x400 + 0x8000 + 0x1000 + 0x8000);
    }

    #[test]
    fn it_should_fail_when_artifact_exceeds_area() {
        let mut artifacts = artifacts();
        artifacts.insert(AreaKind::Dtfs, vec![0; 0x1001]);

        match ComposedImage::compose(&visionfive2(), &artifacts) {
            Err(ComposeError::ArtifactTooLarge { area, len, size }) => {
                assert_eq!(area, "Fixed DTFS");
                assert_eq!(len, 0x1001);
                assert_eq!(size, 0x1000);
            }
            other => panic!("expected ArtifactTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn it_should_fail_when_artifact_is_missing() {
        let mut artifacts = Artifacts::new();
        artifacts.insert(AreaKind::Bt0, vec![0; 4]);

        assert!(matches!(
            ComposedImage::compose(&visionfive2(), &artifacts),
            Err(ComposeError::MissingArtifact(_, _))
        ));
    }

    #[test]
    fn it_should_append_payload_at_offset() {
        let bt0 = vec![0xaa; 0x1000];
        let main = vec![0x55; 0x2345];
        let image = with_payload(&bt0, PAYLOAD_OFFSET, &main).unwrap();

        assert_eq!(image.len(), 0x8000 + main.len());
        assert_eq!(&image[..0x1000], &bt0[..]);
        assert!(image[0x1000..0x8000].iter().all(|&b| b == 0));
        assert_eq!(&image[0x8000..], &main[..]);
    }

    #[test]
    fn it_should_reject_primary_beyond_payload_offset() {
        let bt0 = vec![0; PAYLOAD_OFFSET + 1];

        assert!(matches!(
            with_payload(&bt0, PAYLOAD_OFFSET, &[1, 2, 3]),
            Err(ComposeError::PrimaryExceedsBoundary(0x8001, 0x8000))
        ));
    }

    #[test]
    fn it_should_read_artifacts_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        let names = ArtifactNames::for_board("starfive-visionfive2");

        fs::write(dir.path().join(names.bt0()), [1u8; 8]).unwrap();
        fs::write(dir.path().join(names.dtb()), [2u8; 8]).unwrap();
        fs::write(dir.path().join(names.main()), [3u8; 8]).unwrap();

        let descriptor = visionfive2();
        let artifacts = Artifacts::from_dir(dir.path(), &descriptor).unwrap();
        let image = ComposedImage::compose(&descriptor, &artifacts).unwrap();

        let dtfs = descriptor.area(AreaKind::Dtfs).unwrap();
        assert_eq!(artifacts.for_area(dtfs), Some(&[2u8; 8][..]));
        assert_eq!(image.as_bytes()[0x11400], 3);

        let out = dir.path().join(names.all());
        image.write_to(&out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), image.as_bytes());
        assert_eq!(image.sha256().len(), 64);
    }

    #[test]
    fn it_should_fail_on_unreadable_artifact() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            Artifacts::from_dir(dir.path(), &visionfive2()),
            Err(ComposeError::ArtifactRead(_, _))
        ));
    }

    #[test]
    fn it_should_keep_artifacts_of_reserved_areas_apart() {
        let text = r#"
            [board]
            name = "test"
            category = "test"

            [[flash]]
            description = "first reserved"
            compatible = "reserved"
            size = 0x100
            file = "a.bin"

            [[flash]]
            description = "second reserved"
            compatible = "reserved"
            size = 0x100
            file = "b.bin"

            [memory]
            start = 0
            size = 0x1000
        "#;
        let descriptor: BoardDescriptor = text.parse().unwrap();
        let dir = tempfile::tempdir().unwrap();

        fs::write(dir.path().join("a.bin"), [0xaa; 0x10]).unwrap();
        fs::write(dir.path().join("b.bin"), [0xbb; 0x20]).unwrap();

        let artifacts = Artifacts::from_dir(dir.path(), &descriptor).unwrap();
        let image = ComposedImage::compose(&descriptor, &artifacts).unwrap();
        let bytes = image.as_bytes();

        assert_eq!(&bytes[..0x10], &[0xaa; 0x10][..]);
        assert!(bytes[0x10..0x100].iter().all(|&b| b == 0));
        assert_eq!(&bytes[0x100..0x120], &[0xbb; 0x20][..]);
        assert_eq!(image.placements()[0].artifact_len, Some(0x10));
        assert_eq!(image.placements()[1].artifact_len, Some(0x20));
    }

    #[test]
    fn it_should_prefer_area_artifact_over_tag_artifact() {
        let descriptor = visionfive2();
        let mut artifacts = artifacts();
        artifacts.insert_for_area("Fixed DTFS", vec![0x11; 4]);

        let image = ComposedImage::compose(&descriptor, &artifacts).unwrap();

        assert_eq!(image.as_bytes()[0x10400], 0x11);
        assert_eq!(image.placement(AreaKind::Dtfs).unwrap().artifact_len, Some(4));
    }

    #[test]
    fn it_should_refuse_flash_map_too_large_for_memory() {
        let text = r#"
            [board]
            name = "test"
            category = "test"

            [[flash]]
            description = "header"
            compatible = "header"
            size = 0x400

            [[flash]]
            description = "everything else"
            compatible = "reserved"
            size = 0x7fff_ffff_ffff_ffff

            [memory]
            start = 0
            size = 0x1000
        "#;
        let descriptor: BoardDescriptor = text.parse().unwrap();

        assert!(matches!(
            ComposedImage::compose(&descriptor, &Artifacts::new()),
            Err(ComposeError::ImageTooLarge(0x8000_0000_0000_03ff))
        ));
    }
}
