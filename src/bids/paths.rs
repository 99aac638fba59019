//! Derivative path model.
//!
//! Pure composition from an entity tuple plus a descriptor (and an optional
//! space label) to the derivative path. The composition is total on legal
//! inputs, injective, and platform-stable: paths are composed with forward
//! slashes internally and converted to `PathBuf` only at the I/O boundary.
//! The only I/O anywhere in this module is on-demand directory creation by
//! callers; nothing here touches the filesystem.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bids::entities::EntityTuple;

/// Descriptor of a derivative artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Desc {
    /// MP-PCA denoised series.
    Mppca,
    /// Motion-corrected series.
    Motion,
    /// Motion parameter table.
    MotionParams,
    /// Motion parameter metadata.
    MotionParamsMeta,
    /// Confounds table.
    Confounds,
    /// Confounds descriptor.
    ConfoundsMeta,
    /// Temporal crop sidecar.
    Crop,
    /// Cord mask.
    CordMask,
    /// White-matter mask.
    WmMask,
    /// CSF mask.
    CsfMask,
}

impl Desc {
    /// The `desc-` entity value.
    pub fn label(&self) -> &'static str {
        match self {
            Desc::Mppca => "mppca",
            Desc::Motion => "motion",
            Desc::MotionParams | Desc::MotionParamsMeta => "motion",
            Desc::Confounds | Desc::ConfoundsMeta => "confounds",
            Desc::Crop => "crop",
            Desc::CordMask => "cordmask",
            Desc::WmMask => "wmmask",
            Desc::CsfMask => "csfmask",
        }
    }

    /// Suffix and extension after the `desc-` entity. `None` means the
    /// descriptor itself terminates the name (crop sidecar).
    fn suffix(&self) -> (Option<&'static str>, &'static str) {
        match self {
            Desc::Mppca | Desc::Motion => (Some("bold"), "nii.gz"),
            Desc::MotionParams => (Some("params"), "tsv"),
            Desc::MotionParamsMeta => (Some("params"), "json"),
            Desc::Confounds => (Some("timeseries"), "tsv"),
            Desc::ConfoundsMeta => (Some("timeseries"), "json"),
            Desc::Crop => (None, "json"),
            Desc::CordMask | Desc::WmMask | Desc::CsfMask => (Some("mask"), "nii.gz"),
        }
    }

    /// Whether this descriptor names a subject-level anatomical artifact.
    pub fn is_anatomical(&self) -> bool {
        matches!(self, Desc::CordMask | Desc::WmMask | Desc::CsfMask)
    }
}

/// Output space label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Space {
    /// Subject native space.
    #[serde(rename = "native")]
    Native,
    /// PAM50 template space.
    #[serde(rename = "PAM50")]
    Pam50,
}

impl Space {
    /// The `space-` entity value, or `None` for native (which is implicit and
    /// never written into file names).
    pub fn label(&self) -> Option<&'static str> {
        match self {
            Space::Native => None,
            Space::Pam50 => Some("PAM50"),
        }
    }
}

/// The derivative path model rooted at a derivatives directory.
///
/// Holds only the root; every method is a pure function of its inputs.
#[derive(Debug, Clone)]
pub struct DerivativeLayout {
    root: String,
}

impl DerivativeLayout {
    /// Creates a layout rooted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_string_lossy().replace('\\', "/"),
        }
    }

    /// The derivatives root.
    pub fn root(&self) -> PathBuf {
        PathBuf::from(&self.root)
    }

    fn subject_dir(&self, sub: &str, ses: Option<&str>, modality: &str) -> String {
        match ses {
            Some(ses) => format!("{}/{}/{}/{}", self.root, sub, ses, modality),
            None => format!("{}/{}/{}", self.root, sub, modality),
        }
    }

    fn file_name(base: &str, desc: Desc, space: Space) -> String {
        let mut name = base.to_string();
        if let Some(space_label) = space.label() {
            name.push_str(&format!("_space-{space_label}"));
        }
        name.push_str(&format!("_desc-{}", desc.label()));
        let (suffix, ext) = desc.suffix();
        if let Some(suffix) = suffix {
            name.push_str(&format!("_{suffix}"));
        }
        name.push_str(&format!(".{ext}"));
        name
    }

    /// Composes the path of a per-run functional derivative.
    pub fn func(&self, entities: &EntityTuple, desc: Desc, space: Space) -> PathBuf {
        let dir = self.subject_dir(&entities.sub, entities.ses.as_deref(), "func");
        let name = Self::file_name(&entities.base_name(), desc, space);
        PathBuf::from(format!("{dir}/{name}"))
    }

    /// Composes the path of a subject-level anatomical derivative.
    pub fn anat(&self, sub: &str, ses: Option<&str>, desc: Desc, space: Space) -> PathBuf {
        let dir = self.subject_dir(sub, ses, "anat");
        let base = match ses {
            Some(ses) => format!("{sub}_{ses}"),
            None => sub.to_string(),
        };
        let name = Self::file_name(&base, desc, space);
        PathBuf::from(format!("{dir}/{name}"))
    }

    /// Composes the path of a subject-level warp field under `xfm/`.
    pub fn warp(&self, sub: &str, ses: Option<&str>, from: &str, to: &str) -> PathBuf {
        let dir = self.subject_dir(sub, ses, "xfm");
        let base = match ses {
            Some(ses) => format!("{sub}_{ses}"),
            None => sub.to_string(),
        };
        PathBuf::from(format!("{dir}/{base}_from-{from}_to-{to}_xfm.nii.gz"))
    }

    /// Composes the log directory used for the manifest and execution summary.
    pub fn logs(&self) -> PathBuf {
        PathBuf::from(format!("{}/logs", self.root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn layout() -> DerivativeLayout {
        DerivativeLayout::new(Path::new("/data/derivatives/spineprep"))
    }

    #[test]
    fn test_func_paths() {
        let e = EntityTuple::new("sub-01", "rest", "01");
        assert_eq!(
            layout().func(&e, Desc::Motion, Space::Native),
            PathBuf::from(
                "/data/derivatives/spineprep/sub-01/func/sub-01_task-rest_run-01_desc-motion_bold.nii.gz"
            )
        );
        assert_eq!(
            layout().func(&e, Desc::Confounds, Space::Native),
            PathBuf::from(
                "/data/derivatives/spineprep/sub-01/func/sub-01_task-rest_run-01_desc-confounds_timeseries.tsv"
            )
        );
        assert_eq!(
            layout().func(&e, Desc::Crop, Space::Native),
            PathBuf::from(
                "/data/derivatives/spineprep/sub-01/func/sub-01_task-rest_run-01_desc-crop.json"
            )
        );
    }

    #[test]
    fn test_session_and_space() {
        let e = EntityTuple::new("sub-02", "motor", "03").with_ses("ses-01");
        let p = layout().func(&e, Desc::Motion, Space::Pam50);
        assert_eq!(
            p,
            PathBuf::from(
                "/data/derivatives/spineprep/sub-02/ses-01/func/sub-02_ses-01_task-motor_run-03_space-PAM50_desc-motion_bold.nii.gz"
            )
        );
    }

    #[test]
    fn test_anat_and_warp() {
        let p = layout().anat("sub-01", None, Desc::CordMask, Space::Native);
        assert_eq!(
            p,
            PathBuf::from(
                "/data/derivatives/spineprep/sub-01/anat/sub-01_desc-cordmask_mask.nii.gz"
            )
        );
        let w = layout().warp("sub-01", None, "native", "PAM50");
        assert_eq!(
            w,
            PathBuf::from(
                "/data/derivatives/spineprep/sub-01/xfm/sub-01_from-native_to-PAM50_xfm.nii.gz"
            )
        );
    }

    #[test]
    fn test_injective_over_descriptors() {
        let e = EntityTuple::new("sub-01", "rest", "01");
        let descs = [
            Desc::Mppca,
            Desc::Motion,
            Desc::MotionParams,
            Desc::MotionParamsMeta,
            Desc::Confounds,
            Desc::ConfoundsMeta,
            Desc::Crop,
        ];
        let mut seen = HashSet::new();
        for desc in descs {
            for space in [Space::Native, Space::Pam50] {
                assert!(seen.insert(layout().func(&e, desc, space)));
            }
        }
    }

    #[test]
    fn test_idempotent_composition() {
        let e = EntityTuple::new("sub-09", "rest", "02").with_ses("ses-03");
        let a = layout().func(&e, Desc::Confounds, Space::Native);
        let b = layout().func(&e, Desc::Confounds, Space::Native);
        assert_eq!(a, b);
    }
}
