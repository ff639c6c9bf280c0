//! Predefined commands for common build systems.
//!
//! Some build systems are well known: autotools, for example. Chunks
//! using them do not need to spell out every command; the registry
//! supplies the missing phase commands. A DEFAULTS document may
//! override the command tables of any well-known build system.

use crate::morphology::{BuildPhase, BuildSystemKind, ChunkMorphology, Morphology};
use std::collections::HashMap;

// Strip ELF binaries that are executable or named like a library,
// splitting debug info out next to the prefix.
const STRIP_COMMAND: &str = r#"find "$DESTDIR" -type f '(' -perm -111 -o -name '*.so*' ')' -exec sh -ec 'read -n4 hdr <"$1"; if [ "$hdr" != "$(printf \\x7fELF)" ]; then exit 0; fi; debugfile="$DESTDIR$PREFIX/lib/debug/$(basename "$1")"; mkdir -p "$(dirname "$debugfile")"; objcopy --only-keep-debug "$1" "$debugfile"; chmod 644 "$debugfile"; strip --remove-section=.comment --remove-section=.note --strip-unneeded "$1"; objcopy --add-gnu-debuglink "$debugfile" "$1"' - {} ';'"#;

/// Command table for one build system.
#[derive(Debug, Clone, Default)]
pub struct BuildSystem {
    pub configure_commands: Vec<String>,
    pub build_commands: Vec<String>,
    pub test_commands: Vec<String>,
    pub install_commands: Vec<String>,
    pub strip_commands: Vec<String>,
}

impl BuildSystem {
    pub fn commands(&self, phase: BuildPhase) -> &[String] {
        match phase {
            BuildPhase::Configure => &self.configure_commands,
            BuildPhase::Build => &self.build_commands,
            BuildPhase::Test => &self.test_commands,
            BuildPhase::Install => &self.install_commands,
            BuildPhase::Strip => &self.strip_commands,
        }
    }

    pub fn commands_mut(&mut self, phase: BuildPhase) -> &mut Vec<String> {
        match phase {
            BuildPhase::Configure => &mut self.configure_commands,
            BuildPhase::Build => &mut self.build_commands,
            BuildPhase::Test => &mut self.test_commands,
            BuildPhase::Install => &mut self.install_commands,
            BuildPhase::Strip => &mut self.strip_commands,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn autotools() -> BuildSystem {
    BuildSystem {
        configure_commands: strings(&[
            "export NOCONFIGURE=1; \
             if [ -e autogen ]; then ./autogen; \
             elif [ -e autogen.sh ]; then ./autogen.sh; \
             elif [ -e bootstrap ]; then ./bootstrap; \
             elif [ -e bootstrap.sh ]; then ./bootstrap.sh; \
             elif [ ! -e ./configure ]; then autoreconf -ivf; fi",
            "./configure --prefix=\"$PREFIX\"",
        ]),
        build_commands: strings(&["make"]),
        install_commands: strings(&["make DESTDIR=\"$DESTDIR\" install"]),
        strip_commands: strings(&[STRIP_COMMAND]),
        ..BuildSystem::default()
    }
}

fn python_distutils() -> BuildSystem {
    BuildSystem {
        build_commands: strings(&["python setup.py build"]),
        install_commands: strings(&[
            "python setup.py install --prefix \"$PREFIX\" --root \"$DESTDIR\"",
        ]),
        strip_commands: strings(&[STRIP_COMMAND]),
        ..BuildSystem::default()
    }
}

fn cpan() -> BuildSystem {
    // Perl installs into PREFIX directly, so point it under DESTDIR.
    BuildSystem {
        configure_commands: strings(&["perl Makefile.PL PREFIX=$DESTDIR$PREFIX"]),
        build_commands: strings(&["make"]),
        install_commands: strings(&["make install"]),
        strip_commands: strings(&[STRIP_COMMAND]),
        ..BuildSystem::default()
    }
}

fn module_build() -> BuildSystem {
    BuildSystem {
        configure_commands: strings(&["perl Build.PL --prefix \"$DESTDIR$PREFIX\""]),
        build_commands: strings(&["./Build"]),
        test_commands: strings(&["./Build test"]),
        install_commands: strings(&["./Build install"]),
        ..BuildSystem::default()
    }
}

fn cmake() -> BuildSystem {
    BuildSystem {
        configure_commands: strings(&["cmake -DCMAKE_INSTALL_PREFIX=/usr"]),
        build_commands: strings(&["make"]),
        install_commands: strings(&["make DESTDIR=\"$DESTDIR\" install"]),
        strip_commands: strings(&[STRIP_COMMAND]),
        ..BuildSystem::default()
    }
}

fn qmake() -> BuildSystem {
    BuildSystem {
        configure_commands: strings(&["qmake -makefile"]),
        build_commands: strings(&["make"]),
        install_commands: strings(&["make INSTALL_ROOT=\"$DESTDIR\" install"]),
        strip_commands: strings(&[STRIP_COMMAND]),
        ..BuildSystem::default()
    }
}

fn dummy() -> BuildSystem {
    BuildSystem {
        configure_commands: strings(&["echo dummy configure"]),
        build_commands: strings(&["echo dummy build"]),
        test_commands: strings(&["echo dummy test"]),
        install_commands: strings(&["echo dummy install"]),
        strip_commands: strings(&["echo dummy strip"]),
    }
}

/// Registry of command tables, indexed by build-system kind.
#[derive(Debug, Clone)]
pub struct BuildSystemRegistry {
    systems: HashMap<BuildSystemKind, BuildSystem>,
}

impl Default for BuildSystemRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl BuildSystemRegistry {
    /// The built-in command tables.
    pub fn standard() -> Self {
        let mut systems = HashMap::new();
        systems.insert(BuildSystemKind::Manual, BuildSystem::default());
        systems.insert(BuildSystemKind::Autotools, autotools());
        systems.insert(BuildSystemKind::PythonDistutils, python_distutils());
        systems.insert(BuildSystemKind::Cpan, cpan());
        systems.insert(BuildSystemKind::ModuleBuild, module_build());
        systems.insert(BuildSystemKind::Cmake, cmake());
        systems.insert(BuildSystemKind::Qmake, qmake());
        systems.insert(BuildSystemKind::Dummy, dummy());
        Self { systems }
    }

    pub fn lookup(&self, kind: BuildSystemKind) -> &BuildSystem {
        // Every kind is seeded in standard(); overrides only replace.
        &self.systems[&kind]
    }

    /// Replace the command table of a well-known build system.
    pub fn register(&mut self, kind: BuildSystemKind, system: BuildSystem) {
        self.systems.insert(kind, system);
    }

    /// The main commands of a phase as they will be executed: the
    /// morphology's own list, or the build-system table when absent.
    pub fn resolved_commands(&self, chunk: &ChunkMorphology, phase: BuildPhase) -> Vec<String> {
        match &chunk.phase(phase).main {
            Some(commands) => commands.clone(),
            None => self.lookup(chunk.build_system).commands(phase).to_vec(),
        }
    }
}

/// Infer a build system from a repository's top-level file listing.
///
/// Used when a chunk has no morphology of its own; the well-known
/// marker files decide.
pub fn detect_build_system(file_list: &[String]) -> Option<BuildSystemKind> {
    let has = |name: &str| file_list.iter().any(|f| f == name);

    if has("configure") || has("configure.ac") || has("configure.in") || has("autogen.sh") {
        Some(BuildSystemKind::Autotools)
    } else if has("setup.py") {
        Some(BuildSystemKind::PythonDistutils)
    } else if has("Makefile.PL") {
        Some(BuildSystemKind::Cpan)
    } else if has("Build.PL") {
        Some(BuildSystemKind::ModuleBuild)
    } else if has("CMakeLists.txt") {
        Some(BuildSystemKind::Cmake)
    } else if file_list.iter().any(|f| f.ends_with(".pro")) {
        Some(BuildSystemKind::Qmake)
    } else {
        None
    }
}

/// Synthesise the minimal chunk morphology for a repository whose
/// build system was auto-detected.
pub fn synthesise_morphology(name: &str, kind: BuildSystemKind) -> Morphology {
    Morphology::Chunk(ChunkMorphology {
        name: name.to_string(),
        build_system: kind,
        prefix: "/usr".to_string(),
        ..ChunkMorphology::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_has_no_commands() {
        let registry = BuildSystemRegistry::standard();
        let manual = registry.lookup(BuildSystemKind::Manual);
        for phase in BuildPhase::ALL {
            assert!(manual.commands(phase).is_empty());
        }
    }

    #[test]
    fn autotools_configure_runs_configure() {
        let registry = BuildSystemRegistry::standard();
        let bs = registry.lookup(BuildSystemKind::Autotools);
        assert!(bs.configure_commands[1].contains("./configure"));
        assert_eq!(bs.build_commands, vec!["make"]);
        assert!(bs.install_commands[0].contains("DESTDIR"));
    }

    #[test]
    fn resolved_commands_prefer_morphology() {
        let registry = BuildSystemRegistry::standard();
        let mut chunk = ChunkMorphology {
            name: "foo".to_string(),
            build_system: BuildSystemKind::Autotools,
            ..ChunkMorphology::default()
        };
        chunk.build_commands.main = Some(vec!["make -C src".to_string()]);

        assert_eq!(
            registry.resolved_commands(&chunk, BuildPhase::Build),
            vec!["make -C src"]
        );
        // Unset phases fall back to the build-system table.
        assert_eq!(
            registry.resolved_commands(&chunk, BuildPhase::Install),
            vec!["make DESTDIR=\"$DESTDIR\" install"]
        );
    }

    #[test]
    fn detect_by_marker_files() {
        let files = |names: &[&str]| names.iter().map(|s| (*s).to_string()).collect::<Vec<_>>();

        assert_eq!(
            detect_build_system(&files(&["README", "configure.ac"])),
            Some(BuildSystemKind::Autotools)
        );
        assert_eq!(
            detect_build_system(&files(&["setup.py"])),
            Some(BuildSystemKind::PythonDistutils)
        );
        assert_eq!(
            detect_build_system(&files(&["Makefile.PL"])),
            Some(BuildSystemKind::Cpan)
        );
        assert_eq!(
            detect_build_system(&files(&["Build.PL"])),
            Some(BuildSystemKind::ModuleBuild)
        );
        assert_eq!(
            detect_build_system(&files(&["CMakeLists.txt"])),
            Some(BuildSystemKind::Cmake)
        );
        assert_eq!(
            detect_build_system(&files(&["app.pro"])),
            Some(BuildSystemKind::Qmake)
        );
        assert_eq!(detect_build_system(&files(&["README"])), None);
    }

    #[test]
    fn synthesised_morphology_is_minimal_chunk() {
        let m = synthesise_morphology("busybox", BuildSystemKind::Autotools);
        let chunk = m.as_chunk().unwrap();
        assert_eq!(chunk.name, "busybox");
        assert_eq!(chunk.build_system, BuildSystemKind::Autotools);
        assert_eq!(chunk.prefix, "/usr");
        assert!(chunk.products.is_empty());
    }

    #[test]
    fn register_overrides_table() {
        let mut registry = BuildSystemRegistry::standard();
        registry.register(
            BuildSystemKind::Cmake,
            BuildSystem {
                configure_commands: vec!["cmake -GNinja .".to_string()],
                build_commands: vec!["ninja".to_string()],
                ..BuildSystem::default()
            },
        );
        assert_eq!(
            registry.lookup(BuildSystemKind::Cmake).build_commands,
            vec!["ninja"]
        );
    }
}
