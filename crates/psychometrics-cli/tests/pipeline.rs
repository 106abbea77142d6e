use clap::Parser;
use psychometrics_cli::{run_cli, Cli};
use std::fs;
use std::path::{Path, PathBuf};

fn must_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    result.unwrap_or_else(|err| panic!("unexpected error: {err:?}"))
}

fn execute(args: &[&str]) -> anyhow::Result<()> {
    let cli = Cli::try_parse_from(args).unwrap_or_else(|err| panic!("bad arguments: {err}"));
    run_cli(cli)
}

fn arg(path: &Path) -> String {
    path.display().to_string()
}

fn read(path: &Path) -> String {
    must_ok(fs::read_to_string(path))
}

const SAMPLE_LOG: &str = concat!(
    r#"1:{"event_type": "load_video", "event": "{\"id\": \"v1\"}", "page": "https://h/courses/x/courseware/m1/s1/", "context": {"course_id": "course-v1:org+course+run"}}"#,
    "\n",
    r#"2:{"event_type": "play_video", "event": "{\"id\": \"v1\"}", "context": {"user_id": "uu"}}"#,
    "\n",
    r#"3:{"event_type": "edx.grades.problem.submitted", "event": {"problem_id": "block-v1:x+type@problem+block@pp"}, "referer": "https://h/courses/x/courseware/m2/s2/?child=first", "time": "2018-01-02T09:30:00.123+00:00", "context": {"user_id": "15"}}"#,
    "\n",
    r#"4:{"event_type": "problem_check", "event_source": "server", "event": {"problem_id": "block-v1:x+type@problem+block@pp", "submission": {"t1": {"question": "", "response_type": "type", "correct": false}}}, "context": {"user_id": "15"}, "time": "2018-01-02T09:30:05+00:00"}"#,
    "\n",
    r#"5:{"event_type": "edx.grades.problem.submitted", "event": {"problem_id": "block-v1:x+type@problem+block@pp"}, "referer": "https://h/courses/x/courseware/m2/s2/", "time": "2018-01-02T10:00:00+00:00", "context": {"user_id": "15"}}"#,
    "\n",
    r#"6:{"event_type": "problem_check", "event_source": "server", "event": {"problem_id": "block-v1:x+type@problem+block@pp", "submission": {"t1": {"question": "QQ", "response_type": "type", "correct": true}}}, "context": {"user_id": "15"}, "time": "2018-01-02T10:00:05+00:00"}"#,
    "\n",
    r#"{"event_type": "openassessmentblock.create_submission", "event": {"submission_uuid": "s-1"}, "context": {"user_id": "uu", "module": {"usage_key": "block-v1:x+type@openassessment+block@bb", "display_name": "Essay"}}, "referer": "https://h/courses/x/courseware/m2/s2/"}"#,
    "\n",
    r#"{"event_type": "openassessmentblock.peer_assess", "event": {"submission_uuid": "s-1", "parts": [{"option": {"points": 1}, "criterion": {"points_possible": 2}}, {"option": {"points": 2}, "criterion": {"points_possible": 3}}]}, "context": {"user_id": "u2"}}"#,
    "\n",
    "this line is not an event\n",
    r#"{"event_type": "seek_video", "event": "ignored"}"#,
    "\n",
);

const SAMPLE_OUTLINE: &str = concat!(
    "m1;type@video+block@v1;Module 1\n",
    "m2;type@problem+block@zz;Module 2\n",
);

const SAMPLE_ANSWERS: &str = concat!(
    "1;2018;block@aa;aa_1;77;2018-03-03T12:00:00;1;x;x;Вопрос;tail\n",
    "1;2018;block-v1:x+type@problem+block@pp;t1;15;2018-01-01T00:00:00;1;x;x;Q;tail\n",
    "1;2018;block@cc;cc_1;78;2018.01.01T00:00:00;1;x;x;Q;tail\n",
);

const SAMPLE_NAMES: &str = "org+course+run;Example Course\n";

fn write_sources(dir: &Path) -> (PathBuf, PathBuf, PathBuf, PathBuf) {
    let logs = dir.join("events.log");
    let course = dir.join("course.csv");
    let answers = dir.join("answers.csv");
    let courses = dir.join("courses.csv");
    must_ok(fs::write(&logs, SAMPLE_LOG));
    must_ok(fs::write(&course, SAMPLE_OUTLINE));
    must_ok(fs::write(&answers, SAMPLE_ANSWERS));
    must_ok(fs::write(&courses, SAMPLE_NAMES));
    (logs, course, answers, courses)
}

#[test]
fn full_pipeline_writes_expected_artifacts() {
    let dir = must_ok(tempfile::tempdir());
    let (logs, course, answers, courses) = write_sources(dir.path());
    let prefix = dir.path().join("r");

    must_ok(execute(&[
        "edx2csv",
        "-l",
        &arg(&logs),
        "-c",
        &arg(&course),
        "-a",
        &arg(&answers),
        "-C",
        &arg(&courses),
        &arg(&prefix),
    ]));

    assert_eq!(
        read(&dir.path().join("r1.csv")),
        concat!(
            "user_id;item_id;correct;time\n",
            "15;t1;0;02.01.2018 09:30:00\n",
            "15;t1;1;02.01.2018 10:00:00\n",
            "77;aa_1;1;03.03.2018 12:00:00\n",
        )
    );
    assert_eq!(
        read(&dir.path().join("r2.csv")),
        concat!(
            "item_id;item_type;item_name;module_id;module_order;module_name\n",
            "bb;openassessment;Essay;m2;2;Module 2\n",
            "t1;type;QQ;m2;2;Module 2\n",
        )
    );
    assert_eq!(
        read(&dir.path().join("r3.csv")),
        "user_id;content_piece_id;viewed\nuu;v1;1\n"
    );
    assert_eq!(
        read(&dir.path().join("r4.csv")),
        concat!(
            "content_piece_id;content_piece_type;content_piece_name;",
            "module_id;module_order;module_name\n",
            "v1;video;NA;m1;1;Module 1\n",
        )
    );
    assert_eq!(
        read(&dir.path().join("r5.csv")),
        "user_id;item_id;reviewer_id;score;max_score\nuu;bb;u2;3;5\n"
    );
    assert_eq!(
        read(&dir.path().join("course.json")),
        r#"{"short_name":"org+course+run","long_name":"Example Course"}"#
    );
}

#[test]
fn existing_directory_output_gets_csv_prefix() {
    let dir = must_ok(tempfile::tempdir());
    let (logs, ..) = write_sources(dir.path());
    let out = dir.path().join("out");
    must_ok(fs::create_dir(&out));

    must_ok(execute(&["edx2csv", "-l", &arg(&logs), &arg(&out)]));

    for index in 1..=5 {
        assert!(out.join(format!("csv{index}.csv")).is_file());
    }
    assert!(out.join("course.json").is_file());
}

#[test]
fn missing_optional_sources_default_to_empty() {
    let dir = must_ok(tempfile::tempdir());
    let (logs, ..) = write_sources(dir.path());
    let prefix = dir.path().join("r");

    must_ok(execute(&["edx2csv", "-l", &arg(&logs), &arg(&prefix)]));

    // Without an outline, referenced modules index in sorted id order
    // with placeholder names; without a names table, the long course
    // name repeats the short one.
    assert_eq!(
        read(&dir.path().join("r2.csv")),
        concat!(
            "item_id;item_type;item_name;module_id;module_order;module_name\n",
            "bb;openassessment;Essay;m2;2;NA\n",
            "t1;type;QQ;m2;2;NA\n",
        )
    );
    assert_eq!(
        read(&dir.path().join("course.json")),
        r#"{"short_name":"org+course+run","long_name":"org+course+run"}"#
    );
}

#[test]
fn rerunning_produces_identical_artifacts() {
    let dir = must_ok(tempfile::tempdir());
    let (logs, course, answers, courses) = write_sources(dir.path());
    let prefix = dir.path().join("r");
    let args = [
        "edx2csv".to_string(),
        "-l".to_string(),
        arg(&logs),
        "-c".to_string(),
        arg(&course),
        "-a".to_string(),
        arg(&answers),
        "-C".to_string(),
        arg(&courses),
        arg(&prefix),
    ];
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

    must_ok(execute(&arg_refs));
    let names = ["r1.csv", "r2.csv", "r3.csv", "r4.csv", "r5.csv", "course.json"];
    let first: Vec<String> = names.iter().map(|name| read(&dir.path().join(name))).collect();

    must_ok(execute(&arg_refs));
    for (name, before) in names.iter().zip(&first) {
        assert_eq!(&read(&dir.path().join(name)), before, "{name} changed");
    }
}

#[test]
fn garbage_log_produces_header_only_tables() {
    let dir = must_ok(tempfile::tempdir());
    let logs = dir.path().join("events.log");
    must_ok(fs::write(&logs, "nonsense\n{\"half\": \n42\n"));
    let prefix = dir.path().join("r");

    must_ok(execute(&["edx2csv", "-l", &arg(&logs), &arg(&prefix)]));

    assert_eq!(read(&dir.path().join("r1.csv")), "user_id;item_id;correct;time\n");
    assert_eq!(
        read(&dir.path().join("course.json")),
        r#"{"short_name":"","long_name":""}"#
    );
}

#[test]
fn unreadable_log_fails() {
    let dir = must_ok(tempfile::tempdir());
    let prefix = dir.path().join("r");
    let missing = dir.path().join("missing.log");
    assert!(execute(&["edx2csv", "-l", &arg(&missing), &arg(&prefix)]).is_err());
}
