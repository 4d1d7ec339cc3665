use std::io;

use nexuslang::error::{LexErrorKind, ParseErrorKind};
use nexuslang::{
    build, compile_source, format, run, run_with_config, Constant, ConsoleBridge, ExitStatus,
    FormatError, HostBridge, HostError, Instruction, NexusError, RuntimeFault, TraitVector,
    VmConfig,
};

/// Bridge whose services all fail, except speech which is recorded
#[derive(Default)]
struct OfflineBridge {
    spoken: Vec<String>,
}

impl HostBridge for OfflineBridge {
    fn query_knowledge(&mut self, _text: &str) -> Result<String, HostError> {
        Err(HostError::Timeout)
    }

    fn speak(&mut self, text: &str, _traits: &TraitVector) -> Result<(), HostError> {
        self.spoken.push(text.to_string());
        Ok(())
    }

    fn listen(&mut self) -> Result<String, HostError> {
        Err(HostError::Unavailable("microphone".to_string()))
    }

    fn get_trait(&mut self, _name: &str) -> Result<f64, HostError> {
        Err(HostError::Timeout)
    }
}

const AGENT: &str = r#"
personality {
    warmth: 0.8,
    humor: 0.4
}

fn greet(name) {
    voice.say("hello " + name)
    return knowledge("weather today")
}

let forecast = greet("ada")
if forecast {
    print(forecast)
} else {
    print("no forecast")
}
print(trait(warmth))
"#;

#[test]
fn main_is_called_explicitly() {
    let artifact = build("fn main() { print(\"hi\") } main()").unwrap();
    let result = run(&artifact, &mut OfflineBridge::default()).unwrap();
    assert_eq!(result.status, ExitStatus::Success);
    assert_eq!(result.output, ["hi"]);
}

#[test]
fn main_is_not_called_implicitly() {
    let artifact = build("fn main() { print(\"hi\") }").unwrap();
    let result = run(&artifact, &mut OfflineBridge::default()).unwrap();
    assert_eq!(result.status, ExitStatus::Success);
    assert!(result.output.is_empty());
}

#[test]
fn agent_survives_offline_services() {
    let mut bridge = OfflineBridge::default();
    let artifact = build(AGENT).unwrap();
    let result = run(&artifact, &mut bridge).unwrap();

    assert_eq!(result.status, ExitStatus::Success);
    assert_eq!(result.output, ["no forecast", "0.8"]);
    assert_eq!(bridge.spoken, ["hello ada"]);
}

#[test]
fn artifact_round_trip() {
    let program = compile_source(AGENT).unwrap();
    let bytes = format::serialize(&program);
    assert_eq!(format::deserialize(&bytes).unwrap(), program);
}

#[test]
fn longest_function_name_round_trips() {
    let name = "n".repeat(u16::MAX as usize);
    let source = format!("fn {}() {{ print(1) }} {}()", name, name);
    let program = compile_source(&source).unwrap();
    let bytes = format::serialize(&program);
    assert_eq!(format::deserialize(&bytes).unwrap(), program);

    let name = "n".repeat(u16::MAX as usize + 1);
    let source = format!("fn {}() {{ print(1) }} {}()", name, name);
    let err = build(&source).unwrap_err();
    assert_eq!(err.diagnostic().kind, "CompileError");
}

#[test]
fn builds_are_deterministic() {
    let first = build(AGENT).unwrap();
    assert_eq!(build(AGENT).unwrap(), first);

    let reloaded = format::deserialize(&first).unwrap();
    assert_eq!(format::serialize(&reloaded), first);
}

#[test]
fn corrupted_section_lengths_are_rejected() {
    let artifact = build(AGENT).unwrap();

    // code, data and symbol lengths live at offsets 10, 14 and 18
    for offset in [10, 14, 18] {
        let mut corrupted = artifact.clone();
        corrupted[offset] = corrupted[offset].wrapping_add(1);
        assert!(
            format::deserialize(&corrupted).is_err(),
            "length at offset {} was not checked",
            offset
        );

        let result = run(&corrupted, &mut OfflineBridge::default());
        assert!(result.is_err());
    }
}

#[test]
fn foreign_files_are_rejected() {
    let err = run(b"fn main() {}", &mut OfflineBridge::default()).unwrap_err();
    assert!(matches!(err, FormatError::BadMagic(_)));

    let err = run(b"NXBN", &mut OfflineBridge::default()).unwrap_err();
    assert!(matches!(err, FormatError::TruncatedHeader { .. }));
}

#[test]
fn trait_out_of_range() {
    let err = compile_source("personality { warmth: 1.5 }").unwrap_err();
    match err {
        NexusError::Parse(err) => assert!(matches!(
            err.kind,
            ParseErrorKind::TraitOutOfRange { ref name, value } if name == "warmth" && value == 1.5
        )),
        other => panic!("expected a parse error, got {:?}", other),
    }
}

#[test]
fn deeply_nested_source_is_a_parse_error() {
    for depth in [1_000, 20_000] {
        let source = format!("print({}1{})", "(".repeat(depth), ")".repeat(depth));
        match build(&source).unwrap_err() {
            NexusError::Parse(err) => {
                assert!(matches!(err.kind, ParseErrorKind::NestingTooDeep { .. }))
            }
            other => panic!("expected a parse error, got {:?}", other),
        }
    }
}

#[test]
fn integer_extremes() {
    let artifact = build("print(-9223372036854775808) print(9223372036854775807)").unwrap();
    let result = run(&artifact, &mut OfflineBridge::default()).unwrap();
    assert_eq!(result.status, ExitStatus::Success);
    assert_eq!(result.output, ["-9223372036854775808", "9223372036854775807"]);
}

#[test]
fn division_by_zero_stops_output() {
    let artifact = build("print(\"a\") print(1 / 0) print(\"b\")").unwrap();
    let result = run(&artifact, &mut OfflineBridge::default()).unwrap();
    assert_eq!(result.status, ExitStatus::Fault(RuntimeFault::DivisionByZero));
    assert_eq!(result.output, ["a"]);
}

#[test]
fn constants_are_folded() {
    let program = compile_source("print(2 * 3 + 4)").unwrap();
    assert_eq!(program.constants, [Constant::Integer(10)]);
    assert!(!program
        .instructions
        .iter()
        .any(|instruction| matches!(instruction, Instruction::Add | Instruction::Mul)));
}

#[test]
fn instruction_budget() {
    let artifact = build("let n = 0 while true { n = n + 1 }").unwrap();
    let config = VmConfig {
        max_instructions: Some(1_000),
        ..VmConfig::default()
    };
    let result = run_with_config(&artifact, &mut OfflineBridge::default(), config).unwrap();
    assert_eq!(
        result.status,
        ExitStatus::Fault(RuntimeFault::InstructionLimitExceeded { limit: 1_000 })
    );
}

#[test]
fn diagnostics_carry_positions() {
    let err = compile_source("let a = 1\nlet b = a @ 2").unwrap_err();
    assert!(matches!(
        err,
        NexusError::Lex(ref e) if e.kind == LexErrorKind::UnknownChar('@')
    ));
    let diagnostic = err.diagnostic();
    assert_eq!(diagnostic.kind, "LexError");
    assert_eq!((diagnostic.line, diagnostic.column), (2, 11));

    let json = serde_json::to_value(&diagnostic).unwrap();
    assert_eq!(json["line"], 2);
    assert_eq!(json["message"], "unknown character '@'");

    let err = compile_source("print(missing)").unwrap_err();
    assert_eq!(err.diagnostic().kind, "CompileError");
}

#[test]
fn console_bridge_speaks_with_traits() {
    let mut spoken = Vec::new();
    {
        let mut bridge = ConsoleBridge::new(&b"ada\n"[..], &mut spoken);
        let artifact =
            build("personality { warmth: 0.5 } voice.say(\"hi \" + voice.listen())").unwrap();
        let result = run(&artifact, &mut bridge).unwrap();
        assert_eq!(result.status, ExitStatus::Success);
    }
    assert_eq!(String::from_utf8(spoken).unwrap(), "[voice warmth=0.5] hi ada\n");

    let mut bridge = ConsoleBridge::new(io::empty(), io::sink());
    let artifact = build("print(knowledge(\"anything\"))").unwrap();
    let result = run(&artifact, &mut bridge).unwrap();
    assert_eq!(result.status, ExitStatus::Success);
    assert!(result.output[0].starts_with("error: "));
}
