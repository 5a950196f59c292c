//! Typed builder for compiler invocations.
//!
//! The orchestrator describes each unit with a [`BootImageArgs`] or
//! [`SystemServerArgs`] record; this module turns a record into the compiler's
//! argv. Backends decide how the resulting command is executed.

use std::path::{Path, PathBuf};

use crate::artifacts::ArtifactTriple;
use crate::error::OdrError;
use crate::isa::Isa;

/// Placeholder for a boot image component that is not available.
const MISSING: &str = "-1";

/// Compiled files covering one boot classpath jar, any of which may be absent.
///
/// A multi-jar image is reached through its leading jar; the other jars it
/// covers have no files of their own.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootImageComponent {
    /// `.art` image.
    pub image: Option<PathBuf>,
    /// `.oat` file.
    pub oat: Option<PathBuf>,
    /// `.vdex` file.
    pub vdex: Option<PathBuf>,
}

impl BootImageComponent {
    /// Describe `triple`, marking files that do not exist as absent.
    pub fn from_triple(triple: &ArtifactTriple) -> Self {
        let present = |p: &Path| crate::component::is_file(p).then(|| p.to_path_buf());
        Self {
            image: present(&triple.image),
            oat: present(&triple.oat),
            vdex: present(&triple.vdex),
        }
    }

    /// Returns `true` if at least one file is present.
    pub fn is_available(&self) -> bool {
        self.image.is_some() || self.oat.is_some() || self.vdex.is_some()
    }
}

/// Thread count and CPU affinity for the compiler.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Concurrency {
    /// `-j<N>`.
    pub threads: Option<u32>,
    /// `--cpu-set=<ids>`.
    pub cpu_set: Vec<u32>,
}

impl Concurrency {
    /// Parse a comma-separated CPU set spec; an empty spec means no affinity.
    pub fn parse(threads: Option<u32>, cpu_set: &str) -> Result<Self, OdrError> {
        let cpu_set = if cpu_set.is_empty() {
            Vec::new()
        } else {
            cpu_set
                .split(',')
                .map(|id| id.trim().parse::<u32>())
                .collect::<Result<_, _>>()
                .map_err(|_| OdrError::Unknown(format!("invalid CPU set spec: {cpu_set}")))?
        };
        Ok(Self { threads, cpu_set })
    }
}

/// Everything needed to compile one boot image.
#[derive(Clone, Debug)]
pub struct BootImageArgs {
    /// Short name for logs: `primary`, `minimal` or `mainline`.
    pub label: &'static str,
    /// Target instruction set.
    pub isa: Isa,
    /// Classpath locations of the jars to compile.
    pub dex_locations: Vec<String>,
    /// The same jars, resolved to readable files.
    pub dex_files: Vec<PathBuf>,
    /// Boot classpath the image is linked against.
    pub boot_classpath: Vec<String>,
    /// Boot images to extend; empty for a primary image.
    pub boot_images: Vec<PathBuf>,
    /// Per boot classpath jar, the compiled files that are available.
    pub boot_image_components: Vec<BootImageComponent>,
    /// Staged output files.
    pub outputs: ArtifactTriple,
    /// Final install location of the oat file.
    pub oat_location: PathBuf,
    /// `--compiler-filter` value.
    pub compiler_filter: String,
    /// Profiles guiding the compilation.
    pub profiles: Vec<PathBuf>,
    /// Dirty image objects hint.
    pub dirty_image_objects: Option<PathBuf>,
    /// Preloaded classes hint.
    pub preloaded_classes: Option<PathBuf>,
    /// Threads and CPU affinity.
    pub concurrency: Concurrency,
}

/// Everything needed to compile one system server jar.
#[derive(Clone, Debug)]
pub struct SystemServerArgs {
    /// Target instruction set.
    pub isa: Isa,
    /// Classpath location of the jar.
    pub dex_location: String,
    /// The jar, resolved to a readable file.
    pub dex_file: PathBuf,
    /// Boot classpath the jar runs against.
    pub boot_classpath: Vec<String>,
    /// Boot images the jar is compiled against.
    pub boot_images: Vec<PathBuf>,
    /// Per boot classpath jar, the compiled files that are available.
    pub boot_image_components: Vec<BootImageComponent>,
    /// Staged output files.
    pub outputs: ArtifactTriple,
    /// Final install location of the odex file.
    pub oat_location: PathBuf,
    /// `--compiler-filter` value.
    pub compiler_filter: String,
    /// Profile for `speed-profile`.
    pub profile: Option<PathBuf>,
    /// `--class-loader-context` value.
    pub class_loader_context: String,
    /// Jars named by the class loader context, resolved.
    pub class_loader_context_files: Vec<PathBuf>,
    /// Threads and CPU affinity.
    pub concurrency: Concurrency,
}

/// A typed builder for constructing compiler invocations.
#[derive(Clone, Debug)]
pub struct Dex2oatCommandBuilder {
    program: PathBuf,
    args: Vec<String>,
}

impl Dex2oatCommandBuilder {
    /// Create a new builder for the compiler at `program`.
    pub fn new(program: &Path) -> Self {
        Self {
            program: program.to_path_buf(),
            args: Vec::new(),
        }
    }

    /// Add an input dex container (`--dex-file=<path>`, `--dex-location=<loc>`).
    pub fn dex_file(&mut self, file: &Path, location: &str) -> &mut Self {
        self.args.push(format!("--dex-file={}", file.display()));
        self.args.push(format!("--dex-location={location}"));
        self
    }

    /// Set the boot classpath (`--runtime-arg -Xbootclasspath:<a:b>`).
    pub fn boot_classpath(&mut self, jars: &[String]) -> &mut Self {
        self.runtime_arg(&format!("-Xbootclasspath:{}", jars.join(":")))
    }

    /// Set the boot images to link against (`--boot-image=<a:b>`).
    ///
    /// Nothing is emitted for an empty list.
    pub fn boot_image(&mut self, images: &[PathBuf]) -> &mut Self {
        if !images.is_empty() {
            let joined: Vec<String> = images.iter().map(|p| p.display().to_string()).collect();
            self.args.push(format!("--boot-image={}", joined.join(":")));
        }
        self
    }

    /// Describe the compiled boot classpath, one entry per boot classpath jar,
    /// with `-1` for anything missing
    /// (`-Xbootclasspathimages:`, `-Xbootclasspathoats:`, `-Xbootclasspathvdexes:`).
    ///
    /// Nothing is emitted unless at least one file is available.
    pub fn boot_image_components(&mut self, components: &[BootImageComponent]) -> &mut Self {
        if !components.iter().any(BootImageComponent::is_available) {
            return self;
        }
        let images = join_component(components, |c| c.image.as_ref());
        let oats = join_component(components, |c| c.oat.as_ref());
        let vdexes = join_component(components, |c| c.vdex.as_ref());
        self.runtime_arg(&format!("-Xbootclasspathimages:{images}"))
            .runtime_arg(&format!("-Xbootclasspathoats:{oats}"))
            .runtime_arg(&format!("-Xbootclasspathvdexes:{vdexes}"))
    }

    /// Set the staged output triple (`--image=`, `--oat-file=`, `--output-vdex=`).
    ///
    /// The image is skipped when `with_image` is false.
    pub fn outputs(&mut self, outputs: &ArtifactTriple, with_image: bool) -> &mut Self {
        if with_image {
            self.args.push(format!("--image={}", outputs.image.display()));
        }
        self.args.push(format!("--oat-file={}", outputs.oat.display()));
        self.args.push(format!("--output-vdex={}", outputs.vdex.display()));
        self
    }

    /// Set the location the oat file will be installed at (`--oat-location=<path>`).
    pub fn oat_location(&mut self, path: &Path) -> &mut Self {
        self.args.push(format!("--oat-location={}", path.display()));
        self
    }

    /// Set the target (`--instruction-set=<isa>`).
    pub fn instruction_set(&mut self, isa: Isa) -> &mut Self {
        self.args.push(format!("--instruction-set={isa}"));
        self
    }

    /// Set the compiler filter (`--compiler-filter=<filter>`).
    pub fn compiler_filter(&mut self, filter: &str) -> &mut Self {
        self.args.push(format!("--compiler-filter={filter}"));
        self
    }

    /// Add a profile (`--profile-file=<path>`).
    pub fn profile_file(&mut self, path: &Path) -> &mut Self {
        self.args.push(format!("--profile-file={}", path.display()));
        self
    }

    /// Add the dirty image objects hint (`--dirty-image-objects-file=<path>`).
    pub fn dirty_image_objects(&mut self, path: &Path) -> &mut Self {
        self.args.push(format!("--dirty-image-objects-file={}", path.display()));
        self
    }

    /// Add the preloaded classes hint (`--preloaded-classes-file=<path>`).
    pub fn preloaded_classes(&mut self, path: &Path) -> &mut Self {
        self.args.push(format!("--preloaded-classes-file={}", path.display()));
        self
    }

    /// Set the class loader context (`--class-loader-context=<ctx>`).
    pub fn class_loader_context(&mut self, ctx: &str) -> &mut Self {
        self.args.push(format!("--class-loader-context={ctx}"));
        self
    }

    /// Limit threads and CPUs (`-j<N>`, `--cpu-set=<ids>`).
    pub fn concurrency(&mut self, concurrency: &Concurrency) -> &mut Self {
        if let Some(threads) = concurrency.threads {
            self.args.push(format!("-j{threads}"));
        }
        if !concurrency.cpu_set.is_empty() {
            let ids: Vec<String> = concurrency.cpu_set.iter().map(u32::to_string).collect();
            self.args.push(format!("--cpu-set={}", ids.join(",")));
        }
        self
    }

    /// Pass an argument through to the runtime (`--runtime-arg <arg>`).
    pub fn runtime_arg(&mut self, arg: &str) -> &mut Self {
        self.args.push("--runtime-arg".to_string());
        self.args.push(arg.to_string());
        self
    }

    /// Flags shared by every on-device boot compilation.
    pub fn boot_defaults(&mut self) -> &mut Self {
        for flag in [
            "--compilation-reason=boot",
            "--force-determinism",
            "--abort-on-hard-verifier-error",
            "--no-abort-on-soft-verifier-error",
            "--avoid-storing-invocation",
        ] {
            self.args.push(flag.to_string());
        }
        self
    }

    /// Escape hatch for any arbitrary argument.
    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    /// The compiler executable.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments after the program name.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Space-joined command line for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl BootImageArgs {
    /// Build the compiler command for this boot image.
    pub fn command(&self, program: &Path) -> Dex2oatCommandBuilder {
        let mut cmd = Dex2oatCommandBuilder::new(program);
        cmd.boot_defaults().instruction_set(self.isa);
        for (file, location) in self.dex_files.iter().zip(&self.dex_locations) {
            cmd.dex_file(file, location);
        }
        cmd.boot_classpath(&self.boot_classpath)
            .boot_image(&self.boot_images)
            .boot_image_components(&self.boot_image_components)
            .outputs(&self.outputs, true)
            .oat_location(&self.oat_location)
            .compiler_filter(&self.compiler_filter)
            .concurrency(&self.concurrency)
            .arg("--image-format=lz4");
        for profile in &self.profiles {
            cmd.profile_file(profile);
        }
        if let Some(path) = &self.dirty_image_objects {
            cmd.dirty_image_objects(path);
        }
        if let Some(path) = &self.preloaded_classes {
            cmd.preloaded_classes(path);
        }
        cmd
    }

    /// Files the compiler reads.
    pub fn inputs(&self) -> Vec<PathBuf> {
        let mut files = self.dex_files.clone();
        files.extend(components_files(&self.boot_image_components));
        files.extend(self.profiles.iter().cloned());
        files.extend(self.dirty_image_objects.iter().cloned());
        files.extend(self.preloaded_classes.iter().cloned());
        files
    }
}

impl SystemServerArgs {
    /// Build the compiler command for this jar.
    pub fn command(&self, program: &Path) -> Dex2oatCommandBuilder {
        let mut cmd = Dex2oatCommandBuilder::new(program);
        cmd.boot_defaults()
            .instruction_set(self.isa)
            .dex_file(&self.dex_file, &self.dex_location)
            .boot_classpath(&self.boot_classpath)
            .boot_image(&self.boot_images)
            .boot_image_components(&self.boot_image_components)
            .outputs(&self.outputs, true)
            .oat_location(&self.oat_location)
            .compiler_filter(&self.compiler_filter)
            .class_loader_context(&self.class_loader_context)
            .concurrency(&self.concurrency)
            .arg("--app-image-format=lz4");
        if let Some(profile) = &self.profile {
            cmd.profile_file(profile);
        }
        cmd
    }

    /// Files the compiler reads.
    pub fn inputs(&self) -> Vec<PathBuf> {
        let mut files = vec![self.dex_file.clone()];
        files.extend(components_files(&self.boot_image_components));
        files.extend(self.class_loader_context_files.iter().cloned());
        files.extend(self.profile.iter().cloned());
        files
    }
}

/// Comma-join one file kind across components, `-1` standing in for absent files.
fn join_component(
    components: &[BootImageComponent],
    pick: impl Fn(&BootImageComponent) -> Option<&PathBuf>,
) -> String {
    components
        .iter()
        .map(|c| pick(c).map_or_else(|| MISSING.to_string(), |p| p.display().to_string()))
        .collect::<Vec<_>>()
        .join(",")
}

fn components_files(components: &[BootImageComponent]) -> impl Iterator<Item = PathBuf> + '_ {
    components
        .iter()
        .flat_map(|c| [&c.image, &c.oat, &c.vdex])
        .filter_map(Clone::clone)
}
