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

error_chain! {
    foreign_links {
        Io(::std::io::Error);
    }

    errors {
        /// An error the tool cannot recover from by falling back to the
        /// real compiler: diagnose and exit nonzero.
        Fatal(reason: String) {
            description("fatal error")
            display("{}", reason)
        }
    }
}
