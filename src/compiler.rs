// Copyright 2016 Mozilla Foundation
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Classification of a compiler command line into the argument sets used
//! for hashing, preprocessing and compiling.

use config::Config;
use stats::Statistic;
use std::fs;
use std::path::{Path, PathBuf};
use util::make_relative_path;

/// Supported file extensions and corresponding languages (as passed to
/// the `-x` option).
const EXTENSIONS: &'static [(&'static str, &'static str)] = &[
    (".c", "c"),
    (".C", "c++"),
    (".cc", "c++"),
    (".CC", "c++"),
    (".cpp", "c++"),
    (".CPP", "c++"),
    (".cxx", "c++"),
    (".CXX", "c++"),
    (".c++", "c++"),
    (".C++", "c++"),
    (".i", "cpp-output"),
    (".ii", "c++-cpp-output"),
    (".mi", "objc-cpp-output"),
    (".mii", "objc++-cpp-output"),
    (".m", "objective-c"),
    (".M", "objective-c++"),
    (".mm", "objective-c++"),
];

/// Supported languages and corresponding preprocessed file extensions.
const LANGUAGES: &'static [(&'static str, &'static str)] = &[
    ("c", ".i"),
    ("cpp-output", ".i"),
    ("c++", ".ii"),
    ("c++-cpp-output", ".ii"),
    ("objective-c", ".mi"),
    ("objc-cpp-output", ".mi"),
    ("objective-c++", ".mii"),
    ("objc++-cpp-output", ".mii"),
];

/// Options that never work with a cache in between.
const TOO_HARD: &'static [&'static str] = &[
    "--coverage",
    "-M",
    "-MM",
    "-fbranch-probabilities",
    "-fprofile-arcs",
    "-fprofile-generate",
    "-fprofile-use",
    "-ftest-coverage",
    "-save-temps",
];

/// Options whose following path argument is rewritten relative to the
/// base directory to raise the hit rate.
const REWRITE_PATH_OPTS: &'static [&'static str] = &[
    "-I",
    "-idirafter",
    "-imacros",
    "-include",
    "-iprefix",
    "-isystem",
];

/// Options that take a separate argument.
const TAKES_ARG_OPTS: &'static [&'static str] = &[
    "--param",
    "-A",
    "-D",
    "-G",
    "-L",
    "-MF",
    "-MQ",
    "-MT",
    "-U",
    "-V",
    "-Xassembler",
    "-Xlinker",
    "-aux-info",
    "-b",
    "-iwithprefix",
    "-iwithprefixbefore",
    "-u",
];

pub fn language_for_file(path: &Path) -> Option<&'static str> {
    let name = path.file_name()?.to_str()?;
    let dot = name.rfind('.')?;
    let ext = &name[dot..];
    EXTENSIONS
        .iter()
        .find(|&&(e, _)| e == ext)
        .map(|&(_, language)| language)
}

pub fn i_extension_for_language(language: &str) -> Option<&'static str> {
    LANGUAGES
        .iter()
        .find(|&&(l, _)| l == language)
        .map(|&(_, ext)| ext)
}

fn language_is_supported(language: &str) -> bool {
    i_extension_for_language(language).is_some()
}

/// Whether sources in this language have already been run through the
/// preprocessor.
fn language_is_preprocessed(language: &str) -> bool {
    match i_extension_for_language(language) {
        Some(ext) => language_for_file(Path::new(&format!("x{}", ext))) == Some(language),
        None => false,
    }
}

/// The results of parsing a compiler command line.
#[derive(Debug, PartialEq, Clone)]
pub struct ParsedArguments {
    /// The input source file, rewritten relative to the base directory.
    pub input_file: PathBuf,
    /// The language actually compiled (after `-x`).
    pub language: String,
    /// The object (or assembly) file being produced.
    pub output_obj: PathBuf,
    /// The dependency file, when the invocation generates one.
    pub output_dep: Option<PathBuf>,
    pub generating_dependencies: bool,
    /// Extension (without dot) of the intermediate preprocessed file.
    pub i_extension: String,
    /// The input is already preprocessed, so the preprocessor run can be
    /// skipped.
    pub direct_i_file: bool,
    /// Arguments for the preprocessor invocation (without `-E` and the
    /// input file). These are also the arguments that feed the hashes.
    pub preprocessor_args: Vec<String>,
    /// Arguments for the real compiler invocation (without `-o` and the
    /// input file).
    pub compiler_args: Vec<String>,
    /// An option too hard for direct mode was seen.
    pub disable_direct: bool,
    /// Debug info was requested, so unify hashing is unsafe.
    pub disable_unify: bool,
    /// Whether the compiler may be fed the preprocessed temporary instead
    /// of the original source.
    pub compile_preprocessed: bool,
}

/// The outcome of classifying a command line.
#[derive(Debug, PartialEq, Clone)]
pub enum CompilerArguments {
    Ok(ParsedArguments),
    /// Not a compilation at all (a link, or preprocess-only).
    NotCompilation(Statistic),
    /// A compilation we can't cache; hand it to the real compiler.
    CannotCache(&'static str, Statistic),
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub fn process_args(conf: &Config, argv: &[String]) -> CompilerArguments {
    use self::CompilerArguments::*;

    let base_dir = conf.base_dir.as_ref().map(|p| p.as_path());
    let cwd = &conf.cwd;

    let mut stripped_args: Vec<String> = vec![argv[0].clone()];
    let mut input_file: Option<PathBuf> = None;
    let mut output_obj: Option<PathBuf> = None;
    let mut output_dep: Option<PathBuf> = None;
    let mut explicit_language: Option<String> = None;
    let mut input_charset: Option<String> = None;
    let mut found_c_opt = false;
    let mut found_s_opt = false;
    let mut found_arch_opt = false;
    let mut generating_dependencies = false;
    let mut dependency_filename_specified = false;
    let mut dependency_target_specified = false;
    let mut disable_direct = false;
    let mut disable_unify = false;
    let mut compile_preprocessed = !conf.run_second_cpp;

    let mut i = 1;
    while i < argv.len() {
        let arg = &argv[i];

        // Some options will never work.
        if arg == "-E" {
            debug!("compiler option -E is unsupported");
            return CannotCache("-E", Statistic::UnsupportedCompilerOption);
        }
        if arg.starts_with('@') || TOO_HARD.contains(&arg.as_str()) {
            debug!("compiler option {} is unsupported", arg);
            return CannotCache("option too hard", Statistic::UnsupportedCompilerOption);
        }

        // Too hard in direct mode.
        if arg == "-Xpreprocessor" {
            debug!("unsupported compiler option for direct mode: {}", arg);
            disable_direct = true;
        }

        // Multiple -arch options are too hard.
        if arg == "-arch" {
            if found_arch_opt {
                debug!("more than one -arch compiler option is unsupported");
                return CannotCache("multiple -arch", Statistic::UnsupportedCompilerOption);
            }
            found_arch_opt = true;
        }

        if arg == "-c" {
            stripped_args.push(arg.clone());
            found_c_opt = true;
            i += 1;
            continue;
        }

        // -S changes the default output extension.
        if arg == "-S" {
            stripped_args.push(arg.clone());
            found_s_opt = true;
            i += 1;
            continue;
        }

        // Remember the last language specified before the input file and
        // strip all -x options from the arguments.
        if arg == "-x" {
            if i == argv.len() - 1 {
                debug!("missing argument to {}", arg);
                return CannotCache("missing -x argument", Statistic::BadCompilerArguments);
            }
            if input_file.is_none() {
                explicit_language = Some(argv[i + 1].clone());
            }
            i += 2;
            continue;
        }
        if arg.starts_with("-x") {
            if input_file.is_none() {
                explicit_language = Some(arg[2..].to_owned());
            }
            i += 1;
            continue;
        }

        // Work out where the output is meant to go.
        if arg == "-o" {
            if i == argv.len() - 1 {
                debug!("missing argument to {}", arg);
                return CannotCache("missing -o argument", Statistic::BadCompilerArguments);
            }
            output_obj = Some(PathBuf::from(&argv[i + 1]));
            i += 2;
            continue;
        }
        if arg.starts_with("-o") {
            output_obj = Some(PathBuf::from(&arg[2..]));
            i += 1;
            continue;
        }

        // Debugging is handled specially so we know which hash tricks
        // stay sound.
        if arg.starts_with("-g") {
            stripped_args.push(arg.clone());
            if arg != "-g0" {
                disable_unify = true;
            }
            if arg == "-g3" {
                // Command line macros get nonzero line numbers when the
                // already-preprocessed source is compiled with -g3.
                debug!("{} used; not compiling preprocessed code", arg);
                compile_preprocessed = false;
            }
            i += 1;
            continue;
        }

        // The user knows best: swallow the next argument unexamined.
        if arg == "--ccache-skip" {
            if i == argv.len() - 1 {
                debug!("--ccache-skip lacks an argument");
                return CannotCache("--ccache-skip lacks an argument", Statistic::BadCompilerArguments);
            }
            stripped_args.push(argv[i + 1].clone());
            i += 2;
            continue;
        }

        // Dependency generation behaves differently under -E when no
        // output file is given, so track it here and fix up afterwards.
        if arg == "-MD" || arg == "-MMD" {
            generating_dependencies = true;
        }
        if i < argv.len() - 1 {
            if arg == "-MF" {
                dependency_filename_specified = true;
                output_dep = Some(make_relative_path(base_dir, cwd, Path::new(&argv[i + 1])));
            } else if arg == "-MQ" || arg == "-MT" {
                dependency_target_specified = true;
            }
        }

        if arg.starts_with("-Wp,") {
            let rest = &arg[4..];
            if rest.starts_with("-MD,") && !rest[4..].contains(',') {
                generating_dependencies = true;
                dependency_filename_specified = true;
                output_dep = Some(make_relative_path(base_dir, cwd, Path::new(&rest[4..])));
            } else if rest.starts_with("-MMD,") && !rest[5..].contains(',') {
                generating_dependencies = true;
                dependency_filename_specified = true;
                output_dep = Some(make_relative_path(base_dir, cwd, Path::new(&rest[5..])));
            } else {
                // -Wp, can feed the preprocessor options we can't see
                // through.
                debug!("unsupported compiler option for direct mode: {}", arg);
                disable_direct = true;
            }
        }

        // The input charset must not be applied twice, so it only goes to
        // the preprocessor.
        if arg.starts_with("-finput-charset=") {
            input_charset = Some(arg.clone());
            i += 1;
            continue;
        }

        // Options whose path argument is rewritten relative to the base
        // directory. This also normalizes paths in compiler stderr.
        if REWRITE_PATH_OPTS.contains(&arg.as_str()) {
            if i == argv.len() - 1 {
                debug!("missing argument to {}", arg);
                return CannotCache("missing path argument", Statistic::BadCompilerArguments);
            }
            stripped_args.push(arg.clone());
            let relpath = make_relative_path(base_dir, cwd, Path::new(&argv[i + 1]));
            stripped_args.push(path_str(&relpath));
            i += 2;
            continue;
        }

        // Same, for the joined form.
        if arg.starts_with("-I") {
            let relpath = make_relative_path(base_dir, cwd, Path::new(&arg[2..]));
            stripped_args.push(format!("-I{}", path_str(&relpath)));
            i += 1;
            continue;
        }

        // Options that take a separate argument.
        if TAKES_ARG_OPTS.contains(&arg.as_str()) {
            if i == argv.len() - 1 {
                debug!("missing argument to {}", arg);
                return CannotCache("missing argument", Statistic::BadCompilerArguments);
            }
            stripped_args.push(arg.clone());
            stripped_args.push(argv[i + 1].clone());
            i += 2;
            continue;
        }

        // Other options.
        if arg.starts_with('-') {
            stripped_args.push(arg.clone());
            i += 1;
            continue;
        }

        // If an argument isn't a plain file then assume it's an option,
        // not an input file, to cope with unusual compiler options.
        match fs::metadata(arg) {
            ::std::result::Result::Ok(ref meta) if meta.is_file() => {}
            _ => {
                debug!("{} is not a regular file, not considering as input file", arg);
                stripped_args.push(arg.clone());
                i += 1;
                continue;
            }
        }

        if let Some(ref existing) = input_file {
            if language_for_file(Path::new(arg)).is_some() {
                debug!("multiple input files: {:?} and {}", existing, arg);
                return CannotCache("multiple input files", Statistic::MultipleSourceFiles);
            } else if !found_c_opt {
                debug!("called for link with {}", arg);
                return NotCompilation(link_statistic(arg));
            } else {
                debug!("unsupported source extension: {}", arg);
                return CannotCache("unsupported source extension", Statistic::UnsupportedSourceLanguage);
            }
        }

        // Rewrite to relative to increase the hit rate.
        input_file = Some(make_relative_path(base_dir, cwd, Path::new(arg)));
        i += 1;
    }

    let input_file = match input_file {
        Some(input) => input,
        None => {
            debug!("no input file found");
            return CannotCache("no input file", Statistic::NoInputFile);
        }
    };

    if explicit_language.as_ref().map(|l| l.as_str()) == Some("none") {
        explicit_language = None;
    }
    let file_language = language_for_file(&input_file);
    let actual_language = match explicit_language {
        Some(ref language) => {
            if !language_is_supported(language) {
                debug!("unsupported language: {}", language);
                return CannotCache("unsupported language", Statistic::UnsupportedSourceLanguage);
            }
            language.clone()
        }
        None => match file_language {
            Some(language) => language.to_owned(),
            None => {
                debug!("unsupported source extension: {:?}", input_file);
                return CannotCache("unsupported source extension", Statistic::UnsupportedSourceLanguage);
            }
        },
    };
    let direct_i_file = language_is_preprocessed(&actual_language);

    let i_extension = match conf.i_extension {
        Some(ref ext) => ext.clone(),
        None => match i_extension_for_language(&actual_language) {
            Some(ext) => ext[1..].to_owned(),
            None => {
                return CannotCache("unsupported language", Statistic::UnsupportedSourceLanguage);
            }
        },
    };

    if !found_c_opt {
        debug!("no -c option found");
        // Autoconf tests are the dominant form of "called for link".
        return NotCompilation(link_statistic(&path_str(&input_file)));
    }

    // Don't second-guess the compiler's stdout handling.
    if output_obj.as_ref().map(|o| o.as_os_str() == "-").unwrap_or(false) {
        debug!("output file is -");
        return CannotCache("output to stdout", Statistic::OutputToStdout);
    }

    let output_obj = match output_obj {
        Some(output) => output,
        None => {
            let name = match input_file.file_name() {
                Some(name) => PathBuf::from(name),
                None => {
                    return CannotCache("badly formed object filename", Statistic::BadCompilerArguments)
                }
            };
            match name.extension() {
                Some(_) => name.with_extension(if found_s_opt { "s" } else { "o" }),
                None => {
                    debug!("badly formed object filename");
                    return CannotCache("badly formed object filename", Statistic::BadCompilerArguments);
                }
            }
        }
    };

    // If dependencies are generated, configure the preprocessor.
    if generating_dependencies {
        if !dependency_filename_specified {
            let default_depfile = output_obj.with_extension("d");
            stripped_args.push("-MF".to_owned());
            stripped_args.push(path_str(&default_depfile));
            output_dep = Some(make_relative_path(base_dir, cwd, &default_depfile));
        }
        if !dependency_target_specified {
            stripped_args.push("-MT".to_owned());
            stripped_args.push(path_str(&output_obj));
        }
    }

    // Cope with -o /dev/null.
    if output_obj.as_os_str() != "/dev/null" {
        if let ::std::result::Result::Ok(meta) = fs::metadata(&output_obj) {
            if !meta.is_file() {
                debug!("not a regular file: {:?}", output_obj);
                return CannotCache("output to a non-regular file", Statistic::OutputToDevice);
            }
        }
    }

    // Some options must not reach the compiler when it gets preprocessed
    // code: -finput-charset= (conversion would happen twice) and -x (the
    // wrong language would be selected).
    let mut preprocessor_args = stripped_args.clone();
    if let Some(charset) = input_charset {
        preprocessor_args.push(charset);
    }
    if let Some(ref language) = explicit_language {
        preprocessor_args.push("-x".to_owned());
        preprocessor_args.push(language.clone());
    }
    let compiler_args = if compile_preprocessed {
        let mut args = stripped_args;
        if explicit_language.is_some() {
            if let Some(language) = language_for_file(Path::new(&format!("x.{}", i_extension))) {
                args.push("-x".to_owned());
                args.push(language.to_owned());
            }
        }
        args
    } else {
        preprocessor_args.clone()
    };

    CompilerArguments::Ok(ParsedArguments {
        input_file: input_file,
        language: actual_language,
        output_obj: output_obj,
        output_dep: output_dep,
        generating_dependencies: generating_dependencies,
        i_extension: i_extension,
        direct_i_file: direct_i_file,
        preprocessor_args: preprocessor_args,
        compiler_args: compiler_args,
        disable_direct: disable_direct,
        disable_unify: disable_unify,
        compile_preprocessed: compile_preprocessed,
    })
}

fn link_statistic(input: &str) -> Statistic {
    if input.contains("conftest.") {
        Statistic::Autoconf
    } else {
        Statistic::CalledForLink
    }
}
