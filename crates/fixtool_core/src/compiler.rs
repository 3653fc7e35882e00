use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::fixes::FixScript;
use crate::fixscript::FixOperation;

pub const WINETRICKS_TASK: &str = "winetricks";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("unhandled operation `{operation}` in {title}")]
    UnhandledOperation { operation: String, title: String },
    #[error("malformed operation `{operation}` in {title}: {reason}")]
    MalformedOperation {
        operation: String,
        title: String,
        reason: &'static str,
    },
}

impl CompileError {
    pub fn operation(&self) -> &str {
        match self {
            Self::UnhandledOperation { operation, .. }
            | Self::MalformedOperation { operation, .. } => operation,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game: Option<GameSection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub installer: Vec<InstallerStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wine: Option<WineSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemSection>,
}

impl InstallerDocument {
    pub fn is_empty(&self) -> bool {
        self.game.is_none()
            && self.installer.is_empty()
            && self.wine.is_none()
            && self.system.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
}

impl GameSection {
    fn is_empty(&self) -> bool {
        self.exe.is_none() && self.args.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerStep {
    pub task: InstallerTask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerTask {
    pub name: String,
    pub app: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WineSection {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eac: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battleye: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub esync: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsync: Option<bool>,
}

impl WineSection {
    fn is_empty(&self) -> bool {
        self.overrides.is_empty()
            && self.eac.is_none()
            && self.battleye.is_none()
            && self.esync.is_none()
            && self.fsync.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSection {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_cpu: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_cpu_count: Option<String>,
}

impl SystemSection {
    fn is_empty(&self) -> bool {
        self.env.is_empty() && self.single_cpu.is_none() && self.limit_cpu_count.is_none()
    }
}

/// Every operation name the compiler knows about. Names outside this set are
/// rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownOperation {
    Protontricks,
    AppendArgument,
    WinedllOverride,
    SetEnvironment,
    ReplaceCommand,
    InstallEacRuntime,
    InstallBattleyeRuntime,
    DisableEsync,
    DisableFsync,
    SetCpuTopologyLimit,
    SetIniOptions,
    RegeditAdd,
    DisableProtonAudioConverter,
    AdditionalFixes,
    UseSeccomp,
    MakeSyswow64,
    CreateDosboxConf,
    SetCpuTopologyNosmt,
    SetXmlOptions,
    DisableUplayOverlay,
    DisableNvapi,
}

pub type Effect = fn(&mut InstallerDraft, &FixOperation) -> Result<(), &'static str>;

#[derive(Clone, Copy)]
pub enum Rule {
    Apply(Effect),
    /// Only meaningful for the Proton runtime itself.
    HostOnly,
    /// Not expressible in an installer document yet.
    Deferred,
}

impl KnownOperation {
    pub const ALL: [Self; 21] = [
        Self::Protontricks,
        Self::AppendArgument,
        Self::WinedllOverride,
        Self::SetEnvironment,
        Self::ReplaceCommand,
        Self::InstallEacRuntime,
        Self::InstallBattleyeRuntime,
        Self::DisableEsync,
        Self::DisableFsync,
        Self::SetCpuTopologyLimit,
        Self::SetIniOptions,
        Self::RegeditAdd,
        Self::DisableProtonAudioConverter,
        Self::AdditionalFixes,
        Self::UseSeccomp,
        Self::MakeSyswow64,
        Self::CreateDosboxConf,
        Self::SetCpuTopologyNosmt,
        Self::SetXmlOptions,
        Self::DisableUplayOverlay,
        Self::DisableNvapi,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|operation| operation.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Protontricks => "protontricks",
            Self::AppendArgument => "append_argument",
            Self::WinedllOverride => "winedll_override",
            Self::SetEnvironment => "set_environment",
            Self::ReplaceCommand => "replace_command",
            Self::InstallEacRuntime => "install_eac_runtime",
            Self::InstallBattleyeRuntime => "install_battleye_runtime",
            Self::DisableEsync => "disable_esync",
            Self::DisableFsync => "disable_fsync",
            Self::SetCpuTopologyLimit => "set_cpu_topology_limit",
            Self::SetIniOptions => "set_ini_options",
            Self::RegeditAdd => "regedit_add",
            Self::DisableProtonAudioConverter => "disable_protonaudioconverter",
            Self::AdditionalFixes => "additional_fixes",
            Self::UseSeccomp => "use_seccomp",
            Self::MakeSyswow64 => "_mk_syswow64",
            Self::CreateDosboxConf => "create_dosbox_conf",
            Self::SetCpuTopologyNosmt => "set_cpu_topology_nosmt",
            Self::SetXmlOptions => "set_xml_options",
            Self::DisableUplayOverlay => "disable_uplay_overlay",
            Self::DisableNvapi => "disable_nvapi",
        }
    }

    pub fn rule(self) -> Rule {
        match self {
            Self::Protontricks => Rule::Apply(add_winetricks_step),
            Self::AppendArgument => Rule::Apply(set_game_args),
            Self::WinedllOverride => Rule::Apply(add_dll_override),
            Self::SetEnvironment => Rule::Apply(add_environment_variable),
            Self::ReplaceCommand => Rule::Apply(set_game_exe),
            Self::InstallEacRuntime => Rule::Apply(|draft, _| {
                draft.wine.eac = Some(true);
                Ok(())
            }),
            Self::InstallBattleyeRuntime => Rule::Apply(|draft, _| {
                draft.wine.battleye = Some(true);
                Ok(())
            }),
            Self::DisableEsync => Rule::Apply(|draft, _| {
                draft.wine.esync = Some(false);
                Ok(())
            }),
            Self::DisableFsync => Rule::Apply(|draft, _| {
                draft.wine.fsync = Some(false);
                Ok(())
            }),
            Self::SetCpuTopologyLimit => Rule::Apply(limit_cpu_count),
            Self::SetIniOptions | Self::RegeditAdd => Rule::Deferred,
            Self::DisableProtonAudioConverter
            | Self::AdditionalFixes
            | Self::UseSeccomp
            | Self::MakeSyswow64
            | Self::CreateDosboxConf
            | Self::SetCpuTopologyNosmt
            | Self::SetXmlOptions
            | Self::DisableUplayOverlay
            | Self::DisableNvapi => Rule::HostOnly,
        }
    }
}

#[derive(Debug, Default)]
pub struct InstallerDraft {
    game: GameSection,
    steps: Vec<InstallerStep>,
    wine: WineSection,
    system: SystemSection,
}

impl InstallerDraft {
    fn finish(self) -> InstallerDocument {
        InstallerDocument {
            game: Some(self.game).filter(|section| !section.is_empty()),
            installer: self.steps,
            wine: Some(self.wine).filter(|section| !section.is_empty()),
            system: Some(self.system).filter(|section| !section.is_empty()),
        }
    }
}

/// Translate the operations of one title into an installer document.
pub fn compile_installer(
    title: &str,
    operations: &[FixOperation],
) -> Result<InstallerDocument, CompileError> {
    let mut draft = InstallerDraft::default();
    for operation in operations {
        let Some(known) = KnownOperation::from_name(operation.name()) else {
            return Err(CompileError::UnhandledOperation {
                operation: operation.to_string(),
                title: title.to_string(),
            });
        };
        match known.rule() {
            Rule::Apply(effect) => {
                effect(&mut draft, operation).map_err(|reason| {
                    CompileError::MalformedOperation {
                        operation: operation.to_string(),
                        title: title.to_string(),
                        reason,
                    }
                })?;
            }
            Rule::HostOnly => debug!(%title, %operation, "skipping host-only operation"),
            Rule::Deferred => debug!(%title, %operation, "skipping unsupported operation"),
        }
    }
    Ok(draft.finish())
}

#[derive(Debug, Clone)]
pub struct CompiledScript {
    pub id: String,
    pub result: Result<InstallerDocument, CompileError>,
}

/// Compile every script of a group, in the order given.
pub fn compile_group(scripts: &[FixScript]) -> Vec<CompiledScript> {
    scripts
        .iter()
        .map(|script| CompiledScript {
            id: script.id.clone(),
            result: compile_installer(&script.id, &script.operations),
        })
        .collect()
}

fn required_text(operation: &FixOperation) -> Result<&str, &'static str> {
    operation
        .argument_text()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or("missing argument")
}

fn required_pair(operation: &FixOperation) -> Result<(&str, &str), &'static str> {
    match operation.key_value() {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err("expected key=value argument"),
    }
}

fn add_winetricks_step(
    draft: &mut InstallerDraft,
    operation: &FixOperation,
) -> Result<(), &'static str> {
    let verb = required_text(operation)?;
    draft.steps.push(InstallerStep {
        task: InstallerTask {
            name: WINETRICKS_TASK.to_string(),
            app: verb.to_string(),
        },
    });
    Ok(())
}

fn set_game_args(
    draft: &mut InstallerDraft,
    operation: &FixOperation,
) -> Result<(), &'static str> {
    draft.game.args = Some(required_text(operation)?.to_string());
    Ok(())
}

fn set_game_exe(
    draft: &mut InstallerDraft,
    operation: &FixOperation,
) -> Result<(), &'static str> {
    let exe = match operation.key_value() {
        Some((_, replacement)) if !replacement.is_empty() => replacement,
        _ => required_text(operation)?,
    };
    draft.game.exe = Some(exe.to_string());
    Ok(())
}

fn add_dll_override(
    draft: &mut InstallerDraft,
    operation: &FixOperation,
) -> Result<(), &'static str> {
    let (dll, mode) = required_pair(operation)?;
    draft
        .wine
        .overrides
        .insert(dll.to_string(), mode.to_string());
    Ok(())
}

fn add_environment_variable(
    draft: &mut InstallerDraft,
    operation: &FixOperation,
) -> Result<(), &'static str> {
    let (key, value) = required_pair(operation)?;
    draft.system.env.insert(key.to_string(), value.to_string());
    Ok(())
}

fn limit_cpu_count(
    draft: &mut InstallerDraft,
    operation: &FixOperation,
) -> Result<(), &'static str> {
    let count = required_text(operation)?;
    draft.system.single_cpu = Some(true);
    draft.system.limit_cpu_count = Some(count.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CompileError, KnownOperation, Rule, compile_group, compile_installer};
    use crate::fixes::FixScript;
    use crate::fixscript::{FixOperation, parse_fix_script};

    fn operations(tokens: &[&str]) -> Vec<FixOperation> {
        tokens
            .iter()
            .map(|token| token.parse().expect("infallible"))
            .collect()
    }

    fn compile_json(tokens: &[&str]) -> serde_json::Value {
        let document = compile_installer("X", &operations(tokens)).expect("compile");
        serde_json::to_value(&document).expect("serialize")
    }

    #[test]
    fn eac_runtime_only_populates_wine() {
        assert_eq!(
            compile_json(&["install_eac_runtime"]),
            json!({"wine": {"eac": true}})
        );
    }

    #[test]
    fn winetricks_steps_and_sync_flags() {
        assert_eq!(
            compile_json(&["protontricks: vcrun2019", "disable_esync"]),
            json!({
                "installer": [{"task": {"name": "winetricks", "app": "vcrun2019"}}],
                "wine": {"esync": false}
            })
        );
    }

    #[test]
    fn unknown_operation_fails_with_title() {
        let error = compile_installer("Some Game", &operations(&["totally_unknown_op"]))
            .expect_err("must fail");
        assert_eq!(
            error,
            CompileError::UnhandledOperation {
                operation: "totally_unknown_op".to_string(),
                title: "Some Game".to_string(),
            }
        );
        assert!(error.to_string().contains("Some Game"));
    }

    #[test]
    fn unknown_operation_fails_even_after_valid_ones() {
        let error = compile_installer(
            "X",
            &operations(&["disable_fsync", "util_helper_we_never_saw: 3"]),
        )
        .expect_err("must fail");
        assert_eq!(error.operation(), "util_helper_we_never_saw: 3");
    }

    #[test]
    fn host_only_and_deferred_operations_leave_empty_document() {
        let document = compile_installer(
            "X",
            &operations(&[
                "disable_protonaudioconverter",
                "use_seccomp",
                "_mk_syswow64",
                "create_dosbox_conf",
                "set_cpu_topology_nosmt",
                "set_xml_options: 'a', 'b'",
                "disable_uplay_overlay",
                "disable_nvapi",
                "regedit_add('HKCU\\Software', 'x')",
                "set_ini_options('[x]')",
                "additional_fixes",
            ]),
        )
        .expect("compile");
        assert!(document.is_empty());
        assert_eq!(serde_json::to_value(&document).expect("json"), json!({}));
    }

    #[test]
    fn maps_every_applied_field() {
        assert_eq!(
            compile_json(&[
                "append_argument: -dx11 -nointro",
                "replace_command: Launcher.exe=Game.exe",
                "winedll_override: d3d9=n,b",
                "winedll_override: dinput8=n",
                "set_environment: DXVK_ASYNC=1",
                "install_battleye_runtime",
                "disable_fsync",
                "set_cpu_topology_limit(2)",
            ]),
            json!({
                "game": {"args": "-dx11 -nointro", "exe": "Game.exe"},
                "wine": {
                    "overrides": {"d3d9": "n,b", "dinput8": "n"},
                    "battleye": true,
                    "fsync": false
                },
                "system": {
                    "env": {"DXVK_ASYNC": "1"},
                    "single_cpu": true,
                    "limit_cpu_count": "2"
                }
            })
        );
    }

    #[test]
    fn later_overwrites_win_and_steps_keep_order() {
        assert_eq!(
            compile_json(&[
                "protontricks: d3dx9",
                "append_argument: -a",
                "protontricks: xact",
                "append_argument: -b",
            ]),
            json!({
                "game": {"args": "-b"},
                "installer": [
                    {"task": {"name": "winetricks", "app": "d3dx9"}},
                    {"task": {"name": "winetricks", "app": "xact"}}
                ]
            })
        );
    }

    #[test]
    fn single_argument_replace_command_sets_exe() {
        assert_eq!(
            compile_json(&["replace_command: Game.exe"]),
            json!({"game": {"exe": "Game.exe"}})
        );
    }

    #[test]
    fn missing_arguments_are_malformed() {
        let error = compile_installer("X", &operations(&["protontricks"])).expect_err("must fail");
        assert!(matches!(error, CompileError::MalformedOperation { .. }));

        let error = compile_installer("X", &operations(&["winedll_override: d3d9"]))
            .expect_err("must fail");
        assert!(error.to_string().contains("key=value"));
    }

    #[test]
    fn document_never_contains_empty_sections() {
        let yaml = serde_yaml::to_string(
            &compile_installer("X", &operations(&["disable_esync"])).expect("compile"),
        )
        .expect("yaml");
        assert!(yaml.contains("wine:"));
        assert!(!yaml.contains("game:"));
        assert!(!yaml.contains("installer:"));
        assert!(!yaml.contains("system:"));
        assert!(!yaml.contains("overrides"));
    }

    #[test]
    fn known_operation_names_round_trip() {
        for operation in KnownOperation::ALL {
            assert_eq!(KnownOperation::from_name(operation.as_str()), Some(operation));
        }
        assert!(KnownOperation::from_name("append_arguments").is_none());
        assert!(matches!(
            KnownOperation::AdditionalFixes.rule(),
            Rule::HostOnly
        ));
    }

    #[test]
    fn parsed_script_compiles_end_to_end() {
        let source = r#"
def main():
    util.protontricks('vcrun2019')
    util.winedll_override('d3d9', 'n,b')
    util.set_environment('PROTON_NO_ESYNC', '1')
    util.disable_esync()
    if True:
        pass
"#;
        let document = compile_installer("123", &parse_fix_script(source)).expect("compile");
        assert_eq!(
            serde_json::to_value(&document).expect("json"),
            json!({
                "installer": [{"task": {"name": "winetricks", "app": "vcrun2019"}}],
                "wine": {"overrides": {"d3d9": "n,b"}, "esync": false},
                "system": {"env": {"PROTON_NO_ESYNC": "1"}}
            })
        );
    }

    #[test]
    fn group_compile_reports_per_script_results() {
        let scripts = vec![
            FixScript {
                id: "100".to_string(),
                group: "gamefixes-steam".to_string(),
                operations: vec![FixOperation::bare("disable_esync")],
            },
            FixScript {
                id: "200".to_string(),
                group: "gamefixes-steam".to_string(),
                operations: vec![FixOperation::bare("mystery")],
            },
        ];
        let compiled = compile_group(&scripts);
        assert_eq!(compiled.len(), 2);
        assert!(compiled[0].result.is_ok());
        assert_eq!(compiled[1].id, "200");
        assert!(compiled[1].result.is_err());
    }
}
